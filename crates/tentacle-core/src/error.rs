//! Error types for Tentacle

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`], used to pick a handling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Plugin, directory, metadata or connection does not exist
    NotFound,
    /// Operation collides with one already in progress
    Conflict,
    /// Input failed validation (missing binary, malformed file, ...)
    Validation,
    /// Compiler or dev-server process failure
    Build,
    /// Plugin process died or stopped answering health checks
    Crash,
    /// Unexpected I/O, serialization or other internal failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Build => "build",
            ErrorKind::Crash => "crash",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A structured compiler diagnostic extracted from build tool output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    /// Source file, relative to the plugin source root when possible
    pub file: String,
    /// 1-based line number
    pub line: u32,
    /// 1-based column number (0 when the tool did not report one)
    pub column: u32,
    /// Compiler message
    pub message: String,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.column > 0 {
            write!(f, "{}:{}:{}: {}", self.file, self.line, self.column, self.message)
        } else {
            write!(f, "{}:{}: {}", self.file, self.line, self.message)
        }
    }
}

/// Main error type for Tentacle
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Something the caller referred to does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The plugin is busy with a conflicting operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation failure
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Build failure with any diagnostics the compiler produced
    #[error("Build failed: {message}")]
    Build {
        /// Summary message
        message: String,
        /// Parsed diagnostics
        diagnostics: Vec<BuildError>,
    },

    /// Plugin crashed or failed to recover
    #[error("Plugin '{plugin}' crashed: {message}")]
    Crash {
        /// Plugin ID
        plugin: String,
        /// Crash description
        message: String,
    },

    /// Spawning or signalling an OS process failed
    #[error("Process error: {0}")]
    Process(String),

    /// An operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// RPC returned an error object
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error enriched with user-facing text; the cause stays reachable
    #[error("{title}: {source}")]
    Context {
        /// Short user-facing title
        title: String,
        /// Optional suggestion for fixing the problem
        suggestion: Option<String>,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

/// JSON-RPC "method not found", used by plugins to signal an unimplemented capability
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl fmt::Display) -> Self {
        Self::Conflict(msg.to_string())
    }

    /// Create a validation error
    pub fn validation(msg: impl fmt::Display) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Create a configuration error
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a build error
    pub fn build(msg: impl fmt::Display, diagnostics: Vec<BuildError>) -> Self {
        Self::Build {
            message: msg.to_string(),
            diagnostics,
        }
    }

    /// Create a crash error
    pub fn crash(plugin: impl Into<String>, msg: impl fmt::Display) -> Self {
        Self::Crash {
            plugin: plugin.into(),
            message: msg.to_string(),
        }
    }

    /// Create a process error
    pub fn process(msg: impl fmt::Display) -> Self {
        Self::Process(msg.to_string())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error
    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Wrap this error with a user-facing title and optional suggestion
    pub fn with_context(self, title: impl Into<String>, suggestion: Option<&str>) -> Self {
        Self::Context {
            title: title.into(),
            suggestion: suggestion.map(String::from),
            source: Box::new(self),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Validation(_) | Error::Config(_) => ErrorKind::Validation,
            Error::Build { .. } | Error::Process(_) => ErrorKind::Build,
            Error::Crash { .. } => ErrorKind::Crash,
            Error::Timeout(_)
            | Error::Rpc { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorKind::Internal,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error, skipping any user-facing context layers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is an RPC "method not found" response
    pub fn is_unimplemented(&self) -> bool {
        matches!(self.root(), Error::Rpc { code, .. } if *code == RPC_METHOD_NOT_FOUND)
    }

    /// Build diagnostics carried by this error, if any
    pub fn diagnostics(&self) -> &[BuildError] {
        match self.root() {
            Error::Build { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(Error::conflict("x").kind(), ErrorKind::Conflict);
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(Error::build("x", vec![]).kind(), ErrorKind::Build);
        assert_eq!(Error::crash("p", "x").kind(), ErrorKind::Crash);
        assert_eq!(Error::internal("x").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::not_found("plugin 'demo'")
            .with_context("Could not start plugin", Some("Reinstall the plugin"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err.root(), Error::NotFound(_)));
        assert_eq!(
            err.to_string(),
            "Could not start plugin: Not found: plugin 'demo'"
        );
    }

    #[test]
    fn test_unimplemented_detection() {
        let err = Error::Rpc {
            code: RPC_METHOD_NOT_FOUND,
            message: "method not found".to_string(),
        };
        assert!(err.is_unimplemented());
        assert!(!Error::internal("boom").is_unimplemented());
    }

    #[test]
    fn test_build_error_display() {
        let diag = BuildError {
            file: "main.go".to_string(),
            line: 12,
            column: 4,
            message: "undefined: foo".to_string(),
        };
        assert_eq!(diag.to_string(), "main.go:12:4: undefined: foo");

        let err = Error::build("go build failed", vec![diag.clone()]);
        assert_eq!(err.diagnostics(), &[diag]);
    }
}
