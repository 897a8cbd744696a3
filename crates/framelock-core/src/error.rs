//! Error types for the frame-synchronization layer.
//!
//! Every failure in this layer is fatal to the process that observes it. The
//! only recoverable condition, a temporarily full or empty ring buffer, is
//! handled inside the transports and never surfaces as an error.

use std::time::Duration;
use thiserror::Error;

/// Main error type for framelock.
#[derive(Debug, Error)]
pub enum SyncError {
    // Connection setup errors
    #[error("Cannot connect to {endpoint}: {message}")]
    Connection {
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Peer {endpoint} closed the connection")]
    PeerClosed { endpoint: String },

    #[error("Timed out after {after:?} while {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    // Wire protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Shared memory error: {message}")]
    SharedMemory {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for framelock operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SyncError {
    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol {
            message: message.into(),
        }
    }

    /// Create a connection error with the failing endpoint attached.
    pub fn connection(endpoint: impl Into<String>, err: std::io::Error) -> Self {
        SyncError::Connection {
            endpoint: endpoint.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Create a shared memory error from a failed system call.
    #[cfg(unix)]
    pub fn shared_memory(message: impl Into<String>, err: nix::Error) -> Self {
        SyncError::SharedMemory {
            message: format!("{}: {}", message.into(), err),
            source: Some(err.into()),
        }
    }

    /// Map an IO error raised mid-session on `endpoint`.
    ///
    /// EOF means the peer went away; everything else stays an IO error.
    pub fn from_stream(err: std::io::Error, endpoint: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => SyncError::PeerClosed {
                endpoint: endpoint.to_string(),
            },
            _ => SyncError::Io {
                message: format!("{}: {}", endpoint, err),
                source: Some(err),
            },
        }
    }

    /// Check if this error came from the global timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }

    /// Check if the peer is gone, either by timeout or by closing its end.
    pub fn is_peer_lost(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout { .. } | SyncError::PeerClosed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Timeout {
            operation: "waiting for sync",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Timed out after 250ms while waiting for sync");
    }

    #[test]
    fn test_eof_maps_to_peer_closed() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = SyncError::from_stream(io, "slave 2");
        assert!(matches!(err, SyncError::PeerClosed { ref endpoint } if endpoint == "slave 2"));
        assert!(err.is_peer_lost());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_other_io_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = SyncError::from_stream(io, "slave 1");
        assert!(matches!(err, SyncError::Io { .. }));
        assert!(!err.is_peer_lost());
    }
}
