//! Capability identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named RPC surface a plugin may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Resource listing and CRUD
    Resource,
    /// Exec sessions
    Exec,
    /// Log streaming
    Log,
    /// Metric queries
    Metric,
    /// Port forwarding and networking
    Networker,
    /// Plugin settings
    Settings,
    /// Lifecycle (health, capability listing, shutdown)
    Lifecycle,
    /// Front-end assets, served by the host rather than over RPC
    Ui,
    /// Identifier this host does not know about
    #[serde(other)]
    Unknown,
}

impl Capability {
    /// Capabilities served over RPC by a backend process, in detection order
    pub const BACKEND: [Capability; 6] = [
        Capability::Resource,
        Capability::Exec,
        Capability::Log,
        Capability::Metric,
        Capability::Networker,
        Capability::Settings,
    ];

    /// Whether this capability needs a running backend
    pub fn is_backend(self) -> bool {
        Self::BACKEND.contains(&self)
    }

    /// Identifier used in metadata files and RPC method names
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Resource => "resource",
            Capability::Exec => "exec",
            Capability::Log => "log",
            Capability::Metric => "metric",
            Capability::Networker => "networker",
            Capability::Settings => "settings",
            Capability::Lifecycle => "lifecycle",
            Capability::Ui => "ui",
            Capability::Unknown => "unknown",
        }
    }

    /// Cheap read-only method used to detect the capability when the
    /// plugin cannot list its own capabilities
    pub fn detect_method(self) -> Option<&'static str> {
        match self {
            Capability::Resource => Some("resource.types"),
            Capability::Exec => Some("exec.sessions"),
            Capability::Log => Some("log.sources"),
            Capability::Metric => Some("metric.providers"),
            Capability::Networker => Some("networker.forwards"),
            Capability::Settings => Some("settings.schema"),
            Capability::Lifecycle | Capability::Ui | Capability::Unknown => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "resource" => Capability::Resource,
            "exec" => Capability::Exec,
            "log" => Capability::Log,
            "metric" => Capability::Metric,
            "networker" => Capability::Networker,
            "settings" => Capability::Settings,
            "lifecycle" => Capability::Lifecycle,
            "ui" => Capability::Ui,
            _ => Capability::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for cap in Capability::BACKEND {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!("UI".parse::<Capability>().unwrap(), Capability::Ui);
        assert_eq!("teleport".parse::<Capability>().unwrap(), Capability::Unknown);
    }

    #[test]
    fn test_unknown_capability_deserializes() {
        let caps: Vec<Capability> = serde_json::from_str(r#"["resource","ui","quantum"]"#).unwrap();
        assert_eq!(caps, vec![Capability::Resource, Capability::Ui, Capability::Unknown]);
    }

    #[test]
    fn test_backend_classification() {
        assert!(Capability::Exec.is_backend());
        assert!(!Capability::Ui.is_backend());
        assert!(!Capability::Lifecycle.is_backend());
        assert!(Capability::Ui.detect_method().is_none());
    }
}
