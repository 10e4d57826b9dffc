//! Plugin lifecycle phases and the legal transition table

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginPhase {
    /// Not present on disk
    Uninstalled,
    /// Package is being copied into place
    Installing,
    /// Present on disk, not running
    Installed,
    /// Dev-mode sources are compiling
    Building,
    /// Last dev-mode build failed
    BuildFailed,
    /// Package contents are being checked
    Validating,
    /// Backend process is being launched
    Starting,
    /// Backend is up and healthy
    Running,
    /// Backend is up but reports partial health
    Degraded,
    /// Crash recovery is in progress
    Recovering,
    /// Backend is shutting down
    Stopping,
    /// Cleanly stopped or disabled
    Stopped,
    /// Gave up; needs user action
    Failed,
    /// Package is being removed
    Uninstalling,
}

impl PluginPhase {
    /// Every phase, in declaration order
    pub const ALL: [PluginPhase; 14] = [
        PluginPhase::Uninstalled,
        PluginPhase::Installing,
        PluginPhase::Installed,
        PluginPhase::Building,
        PluginPhase::BuildFailed,
        PluginPhase::Validating,
        PluginPhase::Starting,
        PluginPhase::Running,
        PluginPhase::Degraded,
        PluginPhase::Recovering,
        PluginPhase::Stopping,
        PluginPhase::Stopped,
        PluginPhase::Failed,
        PluginPhase::Uninstalling,
    ];

    /// Phases reachable from `self` through [`crate::PluginStateMachine::transition_to`]
    pub fn allowed_transitions(self) -> &'static [PluginPhase] {
        use PluginPhase::*;
        match self {
            Uninstalled => &[Installing],
            Installing => &[Installed, Failed, Uninstalled],
            Installed => &[Building, Validating, Starting, Stopped, Uninstalling],
            Building => &[BuildFailed, Validating, Installed, Stopped],
            BuildFailed => &[Building, Stopped, Uninstalling],
            Validating => &[Starting, Installed, Failed],
            Starting => &[Running, Failed, Stopping],
            Running => &[Degraded, Recovering, Stopping, Building, Failed],
            Degraded => &[Running, Recovering, Stopping, Failed],
            Recovering => &[Starting, Running, Stopping, Failed],
            Stopping => &[Stopped, Failed],
            Stopped => &[Building, Validating, Starting, Uninstalling],
            Failed => &[Recovering, Building, Validating, Starting, Stopped, Uninstalling],
            Uninstalling => &[Uninstalled, Failed],
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: PluginPhase) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Phases that do not change without an outside trigger
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PluginPhase::Running
                | PluginPhase::Stopped
                | PluginPhase::Failed
                | PluginPhase::BuildFailed
                | PluginPhase::Uninstalled
        )
    }

    /// Phases in which the backend serves requests
    pub fn is_active(self) -> bool {
        matches!(self, PluginPhase::Running | PluginPhase::Degraded)
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            PluginPhase::Uninstalled => "uninstalled",
            PluginPhase::Installing => "installing",
            PluginPhase::Installed => "installed",
            PluginPhase::Building => "building",
            PluginPhase::BuildFailed => "build_failed",
            PluginPhase::Validating => "validating",
            PluginPhase::Starting => "starting",
            PluginPhase::Running => "running",
            PluginPhase::Degraded => "degraded",
            PluginPhase::Recovering => "recovering",
            PluginPhase::Stopping => "stopping",
            PluginPhase::Stopped => "stopped",
            PluginPhase::Failed => "failed",
            PluginPhase::Uninstalling => "uninstalling",
        }
    }
}

impl fmt::Display for PluginPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let terminal: Vec<_> = PluginPhase::ALL
            .iter()
            .copied()
            .filter(|p| p.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                PluginPhase::Uninstalled,
                PluginPhase::BuildFailed,
                PluginPhase::Running,
                PluginPhase::Stopped,
                PluginPhase::Failed,
            ]
        );

        assert!(PluginPhase::Running.is_active());
        assert!(PluginPhase::Degraded.is_active());
        assert!(!PluginPhase::Recovering.is_active());
        assert!(!PluginPhase::Stopped.is_active());
    }

    #[test]
    fn test_table_has_no_self_loops() {
        for phase in PluginPhase::ALL {
            assert!(
                !phase.can_transition_to(phase),
                "{phase} must not transition to itself"
            );
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&PluginPhase::BuildFailed).unwrap();
        assert_eq!(json, "\"build_failed\"");
        let back: PluginPhase = serde_json::from_str("\"recovering\"").unwrap();
        assert_eq!(back, PluginPhase::Recovering);
    }
}
