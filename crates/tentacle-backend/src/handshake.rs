//! Plugin handshake line
//!
//! A plugin announces itself by printing exactly one line to stdout:
//!
//! ```text
//! CORE-PROTOCOL-VERSION|APP-PROTOCOL-VERSION|NETWORK|ADDRESS|PROTOCOL
//! 1|1|tcp|127.0.0.1:41234|jsonrpc
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tentacle_core::Error;

/// Core protocol version the host speaks
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Parsed handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Core protocol version
    pub core_version: u32,
    /// Plugin-defined application protocol version
    pub app_version: u32,
    /// Address the plugin listens on
    pub addr: SocketAddr,
}

impl FromStr for Handshake {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, addr, protocol] = parts.as_slice() else {
            return Err(Error::validation(format!(
                "malformed handshake line: {line:?}"
            )));
        };

        let core_version: u32 = core
            .parse()
            .map_err(|_| Error::validation(format!("invalid core protocol version: {core}")))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(Error::validation(format!(
                "unsupported core protocol version {core_version} (host speaks {CORE_PROTOCOL_VERSION})"
            )));
        }
        let app_version: u32 = app
            .parse()
            .map_err(|_| Error::validation(format!("invalid app protocol version: {app}")))?;
        if *network != "tcp" {
            return Err(Error::validation(format!(
                "unsupported handshake network: {network}"
            )));
        }
        if *protocol != "jsonrpc" {
            return Err(Error::validation(format!(
                "unsupported handshake protocol: {protocol}"
            )));
        }
        let addr = addr
            .parse()
            .map_err(|_| Error::validation(format!("invalid handshake address: {addr}")))?;

        Ok(Self {
            core_version,
            app_version,
            addr,
        })
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|tcp|{}|jsonrpc",
            self.core_version, self.app_version, self.addr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake() {
        let hs: Handshake = "1|3|tcp|127.0.0.1:41234|jsonrpc\n".parse().unwrap();
        assert_eq!(hs.app_version, 3);
        assert_eq!(hs.addr, "127.0.0.1:41234".parse().unwrap());
        assert_eq!(hs.to_string(), "1|3|tcp|127.0.0.1:41234|jsonrpc");
    }

    #[test]
    fn test_reject_bad_handshakes() {
        for line in [
            "",
            "hello world",
            "2|1|tcp|127.0.0.1:1|jsonrpc",
            "1|1|unix|/tmp/sock|jsonrpc",
            "1|1|tcp|127.0.0.1:1|grpc",
            "1|1|tcp|localhost|jsonrpc",
            "1|x|tcp|127.0.0.1:1|jsonrpc",
        ] {
            let err = line.parse::<Handshake>().unwrap_err();
            assert_eq!(err.kind(), tentacle_core::ErrorKind::Validation, "{line}");
        }
    }
}
