//! Error types for the Maquette bridge.
//!
//! Every per-call failure in the dispatch path is captured as a `BridgeError`
//! and returned inside a JSON-RPC error envelope; only `Fatal` (registry load)
//! is allowed to abort server startup.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Dispatch errors
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown command: {method}")]
    UnknownCommand { method: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("smoke test required: write command '{method}' must carry '__smoke_ok': true in params")]
    SmokeRequired { method: String },

    #[error("Execution failed: {message}")]
    Execution { message: String },

    // Port locking errors
    #[error("No free port in {start}-{end} (preferred {preferred})")]
    Unavailable {
        preferred: u16,
        start: u16,
        end: u16,
    },

    // Lifecycle errors
    #[error("Port {port} is owned by pid {owner_pid}, not caller pid {caller_pid}; force-stop requires explicit confirmation")]
    NotOwner {
        port: u16,
        owner_pid: u32,
        caller_pid: u32,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {message}")]
    Network { message: String },

    // Configuration errors (the only startup-aborting kind)
    #[error("Fatal configuration error: {message}")]
    Fatal { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion implementations for common error types

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BridgeError::Timeout(Duration::from_secs(0))
        } else {
            BridgeError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32001: Smoke test required before a write command
    /// - -32002: Command execution failed
    /// - -32003: No port available in the candidate range
    /// - -32004: Stop refused, caller is not the recorded owner
    /// - -32005: Cooperative network operation timed out
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::InvalidRequest { .. } => -32600,
            BridgeError::UnknownCommand { .. } => -32601,
            BridgeError::InvalidArgument { .. } => -32602,
            BridgeError::SmokeRequired { .. } => -32001,
            BridgeError::Execution { .. } => -32002,
            BridgeError::Unavailable { .. } => -32003,
            BridgeError::NotOwner { .. } => -32004,
            BridgeError::Timeout(_) | BridgeError::Network { .. } => -32005,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Check if this error should abort startup rather than be returned
    /// as a call result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::UnknownCommand {
            method: "get_walls".into(),
        };
        assert_eq!(err.to_string(), "Unknown command: get_walls");
    }

    #[test]
    fn test_smoke_message_mentions_smoke() {
        let err = BridgeError::SmokeRequired {
            method: "update_value".into(),
        };
        assert!(err.to_string().contains("smoke"));
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            BridgeError::UnknownCommand {
                method: "nope".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            BridgeError::SmokeRequired {
                method: "update_value".into()
            }
            .to_rpc_error_code(),
            -32001
        );
        assert_eq!(
            BridgeError::Unavailable {
                preferred: 5210,
                start: 5210,
                end: 5219
            }
            .to_rpc_error_code(),
            -32003
        );
        assert_eq!(
            BridgeError::Timeout(Duration::from_millis(300)).to_rpc_error_code(),
            -32005
        );
    }

    #[test]
    fn test_only_fatal_is_fatal() {
        assert!(BridgeError::Fatal {
            message: "missing commands file".into()
        }
        .is_fatal());
        assert!(!BridgeError::Other("anything else".into()).is_fatal());
    }
}
