//! Error types for alertmesh-cluster.

use thiserror::Error;

/// Errors that can occur while replicating state between peers.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The peer could not be reached.
    #[error("peer {address} unreachable: {reason}")]
    Unreachable {
        /// Address that was dialled.
        address: String,
        /// Transport error text.
        reason: String,
    },

    /// The exchange did not complete in time.
    #[error("exchange with {address} timed out")]
    Timeout {
        /// Address that was dialled.
        address: String,
    },

    /// The peer answered with the wrong message kind.
    #[error("unexpected {got} message, expected {expected}")]
    UnexpectedMessage {
        /// Kind that was expected.
        expected: &'static str,
        /// Kind that was received.
        got: &'static str,
    },

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
