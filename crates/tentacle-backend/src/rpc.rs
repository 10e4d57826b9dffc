//! Newline-delimited JSON-RPC 2.0 over TCP
//!
//! [`RpcConnection`] multiplexes concurrent calls over one socket: each
//! request gets an ID and a oneshot channel in the pending map, and a reader
//! task routes responses back by ID. When the socket closes every pending
//! call fails at once.

use crate::backend::CapabilityClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tentacle_core::{Capability, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const JSONRPC_VERSION: &str = "2.0";

/// Lifecycle health method
pub const METHOD_HEALTH: &str = "lifecycle.health";
/// Lifecycle capability listing method
pub const METHOD_CAPABILITIES: &str = "lifecycle.capabilities";
/// Lifecycle graceful shutdown method
pub const METHOD_SHUTDOWN: &str = "lifecycle.shutdown";

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    code: i64,
    message: String,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// A JSON-RPC client connection to one plugin
#[derive(Debug)]
pub struct RpcConnection {
    plugin_id: String,
    peer: SocketAddr,
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl RpcConnection {
    /// Connect to `addr` within `connect_timeout`
    pub async fn connect(
        plugin_id: impl Into<String>,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let plugin_id = plugin_id.into();
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "connecting to plugin '{plugin_id}' at {addr}"
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(plugin_id, stream, addr))
    }

    /// Wrap an established stream
    pub fn from_stream(plugin_id: impl Into<String>, stream: TcpStream, peer: SocketAddr) -> Self {
        let plugin_id = plugin_id.into();
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(Self::reader_loop(
            plugin_id.clone(),
            read_half,
            pending.clone(),
            closed.clone(),
        ));

        Self {
            plugin_id,
            peer,
            next_id: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            closed,
            reader,
        }
    }

    async fn reader_loop(
        plugin_id: String,
        read_half: OwnedReadHalf,
        pending: Pending,
        closed: Arc<AtomicBool>,
    ) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response: Response = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(plugin = %plugin_id, error = %e, "Discarding malformed RPC response");
                            continue;
                        }
                    };
                    let Some(id) = response.id else {
                        trace!(plugin = %plugin_id, "Ignoring RPC message without id");
                        continue;
                    };
                    let Some(sender) = pending.lock().remove(&id) else {
                        debug!(plugin = %plugin_id, id, "Response for unknown request");
                        continue;
                    };
                    let outcome = match response.error {
                        Some(err) => Err(Error::Rpc {
                            code: err.code,
                            message: err.message,
                        }),
                        None => Ok(response.result.unwrap_or(Value::Null)),
                    };
                    let _ = sender.send(outcome);
                }
                Ok(None) => {
                    debug!(plugin = %plugin_id, "RPC connection closed by plugin");
                    break;
                }
                Err(e) => {
                    warn!(plugin = %plugin_id, error = %e, "RPC connection read failed");
                    break;
                }
            }
        }

        Self::fail_pending(&plugin_id, &pending, &closed);
    }

    /// Mark the connection closed and fail every waiting call.
    ///
    /// The flag is set under the pending lock, which `call` also holds while
    /// it checks the flag and registers, so no call can register afterwards.
    fn fail_pending(plugin_id: &str, pending: &Pending, closed: &AtomicBool) {
        let drained: Vec<_> = {
            let mut pending = pending.lock();
            closed.store(true, Ordering::SeqCst);
            pending.drain().collect()
        };
        for (_, sender) in drained {
            let _ = sender.send(Err(Error::crash(plugin_id, "RPC connection closed")));
        }
    }

    /// Peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection has been closed by either side
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Invoke `method` and wait for its response
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::crash(&self.plugin_id, "RPC connection closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_vec(&Request {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        })?;
        payload.push(b'\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.is_closed() {
                return Err(Error::crash(&self.plugin_id, "RPC connection closed"));
            }
            pending.insert(id, tx);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&payload).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        trace!(plugin = %self.plugin_id, id, method, "RPC request sent");
        rx.await
            .unwrap_or_else(|_| Err(Error::crash(&self.plugin_id, "RPC connection closed")))
    }

    /// Invoke `method`, giving up after `limit`
    pub async fn call_timeout(&self, method: &str, params: Value, limit: Duration) -> Result<Value> {
        match tokio::time::timeout(limit, self.call(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "{method} on plugin '{}' after {limit:?}",
                self.plugin_id
            ))),
        }
    }

    /// Close the connection and fail any in-flight calls
    pub fn close(&self) {
        self.reader.abort();
        Self::fail_pending(&self.plugin_id, &self.pending, &self.closed);
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Lifecycle operations shared by every wire-connected backend
#[derive(Debug, Clone)]
pub struct RpcPluginClient {
    conn: Arc<RpcConnection>,
    rpc_timeout: Duration,
}

impl RpcPluginClient {
    /// Wrap a connection
    pub fn new(conn: RpcConnection, rpc_timeout: Duration) -> Self {
        Self {
            conn: Arc::new(conn),
            rpc_timeout,
        }
    }

    /// Underlying connection
    pub fn connection(&self) -> &RpcConnection {
        &self.conn
    }

    /// Ask the plugin for its health.
    ///
    /// `Ok(None)` means the plugin does not implement the health method.
    pub async fn health(&self) -> Result<Option<bool>> {
        match self
            .conn
            .call_timeout(METHOD_HEALTH, Value::Null, self.rpc_timeout)
            .await
        {
            Ok(value) => Ok(Some(parse_health(&value))),
            Err(e) if e.is_unimplemented() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Capabilities the plugin serves.
    ///
    /// Uses `lifecycle.capabilities` when available, otherwise tries one
    /// method per backend capability; "method not found" means absent.
    pub async fn detect_capabilities(&self) -> Result<Vec<Capability>> {
        match self
            .conn
            .call_timeout(METHOD_CAPABILITIES, Value::Null, self.rpc_timeout)
            .await
        {
            Ok(value) => return Ok(parse_capabilities(&value)),
            Err(e) if e.is_unimplemented() => {}
            Err(e) => return Err(e),
        }

        let mut found = Vec::new();
        for capability in Capability::BACKEND {
            let Some(method) = capability.detect_method() else {
                continue;
            };
            match self
                .conn
                .call_timeout(method, Value::Null, self.rpc_timeout)
                .await
            {
                Ok(_) => found.push(capability),
                Err(e) if e.is_unimplemented() => {}
                // The method exists but rejected an empty call
                Err(Error::Rpc { .. }) => found.push(capability),
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Ask the plugin to shut itself down
    pub async fn shutdown(&self) -> Result<()> {
        self.conn
            .call_timeout(METHOD_SHUTDOWN, Value::Null, self.rpc_timeout)
            .await
            .map(|_| ())
    }

    /// Client for one capability
    pub fn dispense(&self, capability: Capability) -> Result<Arc<dyn CapabilityClient>> {
        if !capability.is_backend() {
            return Err(Error::validation(format!(
                "capability '{capability}' is not served over RPC"
            )));
        }
        if self.conn.is_closed() {
            return Err(Error::crash(
                &self.conn.plugin_id,
                format!("cannot dispense '{capability}': connection closed"),
            ));
        }
        Ok(Arc::new(RpcCapabilityClient {
            capability,
            conn: self.conn.clone(),
        }))
    }

    /// Close the connection
    pub fn close(&self) {
        self.conn.close();
    }
}

fn parse_health(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Object(map) => map.get("healthy").and_then(Value::as_bool).unwrap_or(true),
        _ => true,
    }
}

fn parse_capabilities(value: &Value) -> Vec<Capability> {
    let list = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("capabilities") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    let mut caps: Vec<Capability> = list
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|name| name.parse::<Capability>().ok())
        .filter(|c| *c != Capability::Unknown)
        .collect();
    caps.sort();
    caps.dedup();
    caps
}

#[derive(Debug)]
struct RpcCapabilityClient {
    capability: Capability,
    conn: Arc<RpcConnection>,
}

#[async_trait]
impl CapabilityClient for RpcCapabilityClient {
    fn capability(&self) -> Capability {
        self.capability
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.conn
            .call(&format!("{}.{method}", self.capability), params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tentacle_core::RPC_METHOD_NOT_FOUND;
    use tokio::net::TcpListener;

    /// Serve JSON-RPC on a local port, answering with `handler`
    async fn serve<F>(handler: F) -> SocketAddr
    where
        F: Fn(&str) -> std::result::Result<Value, (i64, String)> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let method = req["method"].as_str().unwrap().to_string();
                if method == "test.hangup" {
                    return;
                }
                let body = match handler(&method) {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": req["id"], "result": result}),
                    Err((code, message)) => json!({
                        "jsonrpc": "2.0",
                        "id": req["id"],
                        "error": {"code": code, "message": message},
                    }),
                };
                let mut out = serde_json::to_vec(&body).unwrap();
                out.push(b'\n');
                write.write_all(&out).await.unwrap();
            }
        });
        addr
    }

    fn not_found() -> std::result::Result<Value, (i64, String)> {
        Err((RPC_METHOD_NOT_FOUND, "method not found".to_string()))
    }

    #[tokio::test]
    async fn test_call_and_error() {
        let addr = serve(|method| match method {
            "resource.types" => Ok(json!(["pod", "service"])),
            _ => not_found(),
        })
        .await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();

        let result = conn.call("resource.types", Value::Null).await.unwrap();
        assert_eq!(result, json!(["pod", "service"]));

        let err = conn.call("exec.sessions", Value::Null).await.unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[tokio::test]
    async fn test_hangup_fails_pending_calls() {
        let addr = serve(|_| Ok(Value::Null)).await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();

        let err = conn.call("test.hangup", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), tentacle_core::ErrorKind::Crash);
        assert!(conn.is_closed());
        assert!(conn.call("resource.types", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_calls_racing_a_hangup_all_finish() {
        let addr = serve(|method| Ok(json!(method))).await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = RpcPluginClient::new(conn, Duration::from_secs(1));
        let exec = client.dispense(Capability::Exec).unwrap();

        let mut calls = Vec::new();
        for i in 0..64 {
            let exec = exec.clone();
            calls.push(tokio::spawn(async move {
                exec.call(&format!("run{i}"), Value::Null).await
            }));
            if i == 16 {
                let hangup = client.connection().call("test.hangup", Value::Null);
                assert!(hangup.await.is_err());
            }
        }

        for call in calls {
            let finished = tokio::time::timeout(Duration::from_secs(5), call).await;
            assert!(finished.is_ok(), "call left waiting after the connection closed");
        }
        assert!(client.connection().is_closed());
        assert!(exec.call("run", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_close_fails_later_calls() {
        let addr = serve(|_| Ok(Value::Null)).await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        conn.close();
        assert!(conn.is_closed());
        let err = conn.call("resource.types", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), tentacle_core::ErrorKind::Crash);
    }

    #[tokio::test]
    async fn test_health_fallbacks() {
        let addr = serve(|_| not_found()).await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = RpcPluginClient::new(conn, Duration::from_secs(1));
        assert_eq!(client.health().await.unwrap(), None);

        let addr = serve(|_| Ok(json!({"healthy": false}))).await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = RpcPluginClient::new(conn, Duration::from_secs(1));
        assert_eq!(client.health().await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_detect_via_lifecycle() {
        let addr = serve(|method| match method {
            METHOD_CAPABILITIES => Ok(json!({"capabilities": ["log", "resource", "bogus", "log"]})),
            _ => not_found(),
        })
        .await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = RpcPluginClient::new(conn, Duration::from_secs(1));
        assert_eq!(
            client.detect_capabilities().await.unwrap(),
            vec![Capability::Resource, Capability::Log]
        );
    }

    #[tokio::test]
    async fn test_detect_via_probing() {
        let addr = serve(|method| match method {
            "resource.types" => Ok(json!([])),
            "settings.schema" => Err((-32602, "invalid params".to_string())),
            _ => not_found(),
        })
        .await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = RpcPluginClient::new(conn, Duration::from_secs(1));
        assert_eq!(
            client.detect_capabilities().await.unwrap(),
            vec![Capability::Resource, Capability::Settings]
        );
    }

    #[tokio::test]
    async fn test_dispensed_client_prefixes_method() {
        let addr = serve(|method| Ok(json!(method))).await;
        let conn = RpcConnection::connect("demo", addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = RpcPluginClient::new(conn, Duration::from_secs(1));

        let exec = client.dispense(Capability::Exec).unwrap();
        assert_eq!(exec.capability(), Capability::Exec);
        assert_eq!(exec.call("run", Value::Null).await.unwrap(), json!("exec.run"));

        assert!(client.dispense(Capability::Ui).is_err());
    }

    #[test]
    fn test_parse_health_shapes() {
        assert!(parse_health(&Value::Null));
        assert!(parse_health(&json!(true)));
        assert!(!parse_health(&json!(false)));
        assert!(!parse_health(&json!({"healthy": false, "message": "db down"})));
    }
}
