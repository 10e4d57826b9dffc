//! Periodic health checking and crash recovery
//!
//! The [`HealthChecker`] polls every active backend on a fixed interval.
//! An unhealthy backend is treated as crashed: the plugin moves to
//! `Recovering` and is reloaded with exponential backoff until it comes
//! back or the retry budget runs out, at which point it is left `Failed`.
//!
//! Each plugin has at most one recovery in flight. Starting a new one
//! cancels the previous one, and the whole set is cancelled with the
//! checker's root token.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tentacle_backend::Backend;
use tentacle_core::events::{PLUGIN_CRASHED, PLUGIN_RECOVERED, PLUGIN_RECOVERY_FAILED};
use tentacle_core::{EventSink, PluginPhase, PluginStateMachine, Result, RetryPolicy, RetryState};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the health checker needs from the plugin table
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Active plugins and their backends
    fn running_backends(&self) -> Vec<(String, Arc<dyn Backend>)>;

    /// Phase tracker of `plugin_id`, if it is still known
    fn state_machine(&self, plugin_id: &str) -> Option<Arc<PluginStateMachine>>;

    /// Unload and load `plugin_id` again
    async fn reload(&self, plugin_id: &str) -> Result<()>;

    /// Remember `message` as the plugin's latest error
    fn record_error(&self, plugin_id: &str, message: &str);
}

/// How a recovery loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A reload succeeded
    Recovered,
    /// The retry budget ran out; the plugin is `Failed`
    Exhausted,
    /// Cancelled by shutdown, uninstall or a newer recovery
    Cancelled,
    /// The plugin disappeared from the table
    Abandoned,
}

/// Health polling and crash recovery
pub struct HealthChecker {
    target: Arc<dyn RecoveryTarget>,
    policy: RetryPolicy,
    interval: Duration,
    events: Arc<dyn EventSink>,
    root: CancellationToken,
    recoveries: DashMap<String, (u64, CancellationToken)>,
    next_epoch: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("policy", &self.policy)
            .field("interval", &self.interval)
            .field("recovering", &self.recoveries.len())
            .field("running", &self.ticker.lock().is_some())
            .finish()
    }
}

impl HealthChecker {
    /// Create a checker; cancelling `root` stops polling and every recovery
    pub fn new(
        target: Arc<dyn RecoveryTarget>,
        policy: RetryPolicy,
        interval: Duration,
        events: Arc<dyn EventSink>,
        root: CancellationToken,
    ) -> Self {
        Self {
            target,
            policy,
            interval,
            events,
            root,
            recoveries: DashMap::new(),
            next_epoch: AtomicU64::new(0),
            ticker: Mutex::new(None),
        }
    }

    /// Retry limits used by recovery
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Start the polling loop; a no-op if it is already running
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let checker = Arc::clone(self);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = checker.root.cancelled() => break,
                    _ = interval.tick() => {
                        checker.check_all().await;
                    }
                }
            }
            debug!("Health checker stopped");
        }));
        info!(interval = ?self.interval, "Health checker started");
    }

    /// Check every active backend once.
    ///
    /// Plugins already under recovery are skipped. Returns the IDs found
    /// unhealthy, each of which now has a recovery running.
    pub async fn check_all(self: &Arc<Self>) -> Vec<String> {
        let candidates: Vec<(String, Arc<dyn Backend>)> = self
            .target
            .running_backends()
            .into_iter()
            .filter(|(id, _)| !self.is_recovering(id))
            .collect();

        let results = join_all(candidates.iter().map(|(id, backend)| async move {
            (id.clone(), backend.healthy().await)
        }))
        .await;

        let mut unhealthy = Vec::new();
        for (plugin_id, healthy) in results {
            if healthy {
                debug!(plugin = %plugin_id, "Health check passed");
                continue;
            }
            warn!(plugin = %plugin_id, "Health check failed");
            self.handle_plugin_crash(&plugin_id, "health check failed");
            unhealthy.push(plugin_id);
        }
        unhealthy
    }

    /// Record a crash and start recovering `plugin_id` in the background
    pub fn handle_plugin_crash(self: &Arc<Self>, plugin_id: &str, reason: &str) -> JoinHandle<RecoveryOutcome> {
        self.target
            .record_error(plugin_id, &format!("plugin crashed: {reason}"));
        self.events.emit(
            PLUGIN_CRASHED,
            json!({ "pluginId": plugin_id, "error": reason }),
        );

        let (epoch, token) = self.begin_recovery(plugin_id);
        let checker = Arc::clone(self);
        let plugin_id = plugin_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            checker
                .run_recovery(&plugin_id, &reason, epoch, token)
                .await
        })
    }

    /// Recover `plugin_id` on the current task.
    ///
    /// This is the only place a plugin enters `Recovering`. Any recovery
    /// already running for the plugin is cancelled first.
    pub async fn handle_crash_with_backoff(&self, plugin_id: &str, reason: &str) -> RecoveryOutcome {
        let (epoch, token) = self.begin_recovery(plugin_id);
        self.run_recovery(plugin_id, reason, epoch, token).await
    }

    /// Cancel the recovery of `plugin_id`, if one is running
    pub fn cancel_recovery(&self, plugin_id: &str) {
        if let Some((_, (_, token))) = self.recoveries.remove(plugin_id) {
            debug!(plugin = %plugin_id, "Recovery cancelled");
            token.cancel();
        }
    }

    /// Whether a recovery is in flight for `plugin_id`
    pub fn is_recovering(&self, plugin_id: &str) -> bool {
        self.recoveries.contains_key(plugin_id)
    }

    /// Stop polling and cancel every recovery
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        let ids: Vec<String> = self.recoveries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_recovery(&id);
        }
    }

    fn begin_recovery(&self, plugin_id: &str) -> (u64, CancellationToken) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.root.child_token();
        if let Some((_, previous)) = self
            .recoveries
            .insert(plugin_id.to_string(), (epoch, token.clone()))
        {
            debug!(plugin = %plugin_id, "Superseding running recovery");
            previous.cancel();
        }
        (epoch, token)
    }

    async fn run_recovery(
        &self,
        plugin_id: &str,
        reason: &str,
        epoch: u64,
        token: CancellationToken,
    ) -> RecoveryOutcome {
        let outcome = self.recovery_loop(plugin_id, reason, &token).await;
        self.recoveries
            .remove_if(plugin_id, |_, (current, _)| *current == epoch);
        outcome
    }

    async fn recovery_loop(&self, plugin_id: &str, reason: &str, token: &CancellationToken) -> RecoveryOutcome {
        if token.is_cancelled() {
            return RecoveryOutcome::Cancelled;
        }
        let Some(machine) = self.target.state_machine(plugin_id) else {
            return RecoveryOutcome::Abandoned;
        };
        if machine.transition_to(PluginPhase::Recovering, reason).is_err() {
            machine.force_phase(PluginPhase::Recovering, reason);
        }

        let mut retry = RetryState::new(self.policy);
        let mut last_error = reason.to_string();

        loop {
            if token.is_cancelled() {
                return RecoveryOutcome::Cancelled;
            }
            if !retry.can_retry() {
                let message = format!(
                    "recovery failed after {} attempts: {last_error}",
                    retry.attempts()
                );
                machine.force_phase(PluginPhase::Failed, message.clone());
                self.target.record_error(plugin_id, &message);
                error!(plugin = %plugin_id, attempts = retry.attempts(), error = %last_error, "Plugin recovery failed");
                self.events.emit(
                    PLUGIN_RECOVERY_FAILED,
                    json!({
                        "pluginId": plugin_id,
                        "attempts": retry.attempts(),
                        "error": message,
                    }),
                );
                return RecoveryOutcome::Exhausted;
            }

            let backoff = retry.next_backoff();
            info!(
                plugin = %plugin_id,
                attempt = retry.attempts() + 1,
                backoff = ?backoff,
                "Restarting plugin after backoff"
            );
            tokio::select! {
                _ = token.cancelled() => return RecoveryOutcome::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }
            if self.target.state_machine(plugin_id).is_none() {
                return RecoveryOutcome::Abandoned;
            }

            match self.target.reload(plugin_id).await {
                Ok(()) => {
                    let attempts = retry.attempts() + 1;
                    retry.reset();
                    info!(plugin = %plugin_id, attempts, "Plugin recovered");
                    self.events.emit(
                        PLUGIN_RECOVERED,
                        json!({ "pluginId": plugin_id, "attempts": attempts }),
                    );
                    return RecoveryOutcome::Recovered;
                }
                Err(e) => {
                    warn!(plugin = %plugin_id, error = %e, "Restart attempt failed");
                    last_error = e.to_string();
                    retry.advance();
                    if machine.phase() != PluginPhase::Recovering {
                        let _ = machine.transition_to(PluginPhase::Recovering, "retrying");
                    }
                }
            }
        }
    }
}
