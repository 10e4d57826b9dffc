//! Per-plugin lifecycle state machine
//!
//! A [`PluginStateMachine`] owns one plugin's current [`PluginPhase`], a
//! bounded history of [`Transition`]s and a list of observers. Every change
//! is validated against [`PluginPhase::allowed_transitions`] unless it goes
//! through [`PluginStateMachine::force_phase`].

use crate::error::{Error, Result};
use crate::phase::PluginPhase;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of transitions kept in history
pub const HISTORY_CAPACITY: usize = 50;

/// A single recorded phase change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Phase before the change
    pub from: PluginPhase,
    /// Phase after the change
    pub to: PluginPhase,
    /// Why the change happened
    pub reason: String,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked synchronously on every transition.
///
/// Runs while the machine's lock is held, so it must not block and must
/// not call back into the same machine.
pub type TransitionObserver = Arc<dyn Fn(&str, &Transition) + Send + Sync>;

struct Inner {
    phase: PluginPhase,
    history: VecDeque<Transition>,
    observers: Vec<TransitionObserver>,
}

/// Synchronized phase tracker for one plugin
pub struct PluginStateMachine {
    plugin_id: String,
    inner: Mutex<Inner>,
}

impl fmt::Debug for PluginStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PluginStateMachine")
            .field("plugin_id", &self.plugin_id)
            .field("phase", &inner.phase)
            .field("history_len", &inner.history.len())
            .field("observers", &inner.observers.len())
            .finish()
    }
}

impl PluginStateMachine {
    /// Create a machine starting in `initial`
    pub fn new(plugin_id: impl Into<String>, initial: PluginPhase) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            inner: Mutex::new(Inner {
                phase: initial,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                observers: Vec::new(),
            }),
        }
    }

    /// Plugin this machine belongs to
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Current phase
    pub fn phase(&self) -> PluginPhase {
        self.inner.lock().phase
    }

    /// Copy of the transition history, oldest first
    pub fn history(&self) -> Vec<Transition> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Register an observer
    pub fn add_observer(&self, observer: TransitionObserver) {
        self.inner.lock().observers.push(observer);
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// On rejection the phase and history are left untouched.
    pub fn transition_to(&self, next: PluginPhase, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        let current = inner.phase;
        if !current.can_transition_to(next) {
            return Err(Error::validation(format!(
                "illegal transition for plugin '{}': {current} -> {next}",
                self.plugin_id
            )));
        }
        self.apply(&mut inner, next, reason.into());
        Ok(())
    }

    /// Set the phase unconditionally.
    ///
    /// Used when rebuilding state from persisted records or finishing a
    /// load, where the previous phase is not trusted.
    pub fn force_phase(&self, next: PluginPhase, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, next, reason.into());
    }

    fn apply(&self, inner: &mut Inner, next: PluginPhase, reason: String) {
        let transition = Transition {
            from: inner.phase,
            to: next,
            reason,
            timestamp: Utc::now(),
        };

        debug!(
            plugin = %self.plugin_id,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "Plugin phase changed"
        );

        inner.phase = next;
        if inner.history.len() == HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(transition.clone());

        for observer in &inner.observers {
            observer(&self.plugin_id, &transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn phase_strategy() -> impl Strategy<Value = PluginPhase> {
        (0..PluginPhase::ALL.len()).prop_map(|i| PluginPhase::ALL[i])
    }

    #[test]
    fn test_legal_transition() {
        let sm = PluginStateMachine::new("demo", PluginPhase::Installed);
        sm.transition_to(PluginPhase::Validating, "load").unwrap();
        sm.transition_to(PluginPhase::Starting, "validated").unwrap();
        assert_eq!(sm.phase(), PluginPhase::Starting);

        let history = sm.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, PluginPhase::Installed);
        assert_eq!(history[1].to, PluginPhase::Starting);
        assert_eq!(history[1].reason, "validated");
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let sm = PluginStateMachine::new("demo", PluginPhase::Uninstalled);
        let err = sm.transition_to(PluginPhase::Running, "nope").unwrap_err();
        assert!(err.to_string().contains("uninstalled -> running"));
        assert_eq!(sm.phase(), PluginPhase::Uninstalled);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn test_observers_see_every_transition() {
        let sm = PluginStateMachine::new("demo", PluginPhase::Installed);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        sm.add_observer(Arc::new(move |id, t| {
            assert_eq!(id, "demo");
            assert_ne!(t.from, t.to);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        sm.transition_to(PluginPhase::Starting, "start").unwrap();
        sm.force_phase(PluginPhase::Running, "loaded");
        let _ = sm.transition_to(PluginPhase::Installing, "illegal");

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn prop_illegal_pairs_never_mutate(from in phase_strategy(), to in phase_strategy()) {
            prop_assume!(!from.can_transition_to(to));
            let sm = PluginStateMachine::new("p", from);
            prop_assert!(sm.transition_to(to, "x").is_err());
            prop_assert_eq!(sm.phase(), from);
            prop_assert!(sm.history().is_empty());
        }

        #[test]
        fn prop_force_phase_always_records(from in phase_strategy(), to in phase_strategy()) {
            let sm = PluginStateMachine::new("p", from);
            sm.force_phase(to, "forced");
            prop_assert_eq!(sm.phase(), to);
            let history = sm.history();
            prop_assert_eq!(history.len(), 1);
            prop_assert_eq!(history[0].from, from);
            prop_assert_eq!(history[0].to, to);
        }

        #[test]
        fn prop_history_is_bounded(targets in proptest::collection::vec(phase_strategy(), 0..200)) {
            let sm = PluginStateMachine::new("p", PluginPhase::Installed);
            for (i, to) in targets.iter().enumerate() {
                sm.force_phase(*to, format!("step {i}"));
            }
            let history = sm.history();
            prop_assert!(history.len() <= HISTORY_CAPACITY);
            prop_assert_eq!(history.len(), targets.len().min(HISTORY_CAPACITY));
            if let Some(last) = history.last() {
                prop_assert_eq!(last.reason.clone(), format!("step {}", targets.len() - 1));
            }
        }
    }
}
