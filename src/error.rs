//! Error types for minikv
//!
//! Defines a unified error type that can represent failures from every
//! layer: file I/O (WAL, checkpoint), the wire protocol, the store, and
//! the cluster coordinator.

use std::fmt;
use std::io;

/// Unified error type for minikv operations
#[derive(Debug)]
pub enum KvError {
    /// I/O error (WAL writes, checkpoint files, sockets)
    Io(io::Error),
    /// Protocol error (malformed frame body, unknown operation)
    Protocol(String),
    /// Store-level error
    Store(String),
    /// Cluster coordination error (peer RPC, election)
    Cluster(String),
    /// Peer did not answer within the RPC timeout
    Timeout(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Io(e) => write!(f, "{}", e),
            KvError::Protocol(msg) => write!(f, "{}", msg),
            KvError::Store(msg) => write!(f, "{}", msg),
            KvError::Cluster(msg) => write!(f, "{}", msg),
            KvError::Timeout(msg) => write!(f, "timed out: {}", msg),
        }
    }
}

impl std::error::Error for KvError {}

impl From<io::Error> for KvError {
    fn from(e: io::Error) -> Self {
        KvError::Io(e)
    }
}

impl From<serde_json::Error> for KvError {
    fn from(e: serde_json::Error) -> Self {
        KvError::Protocol(e.to_string())
    }
}

/// Result type alias for minikv operations
pub type Result<T> = std::result::Result<T, KvError>;
