//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Classified errors returned by a [`crate::node::NodeClient`].
///
/// The client itself never retries; the classification tells the block
/// processor how to route the failure.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Timeouts, connection resets, 5xx — worth re-queueing.
    #[error("transient node error: {0}")]
    Transient(String),

    /// The requested entity does not exist. For `block_by_number` past the
    /// chain head this is the normal waited-past-tip signal, not a failure.
    #[error("not found")]
    NotFound,

    /// The node returned data that could not be decoded.
    #[error("malformed node response: {0}")]
    Malformed(String),
}

impl NodeError {
    /// Returns `true` if the caller should re-queue the block.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors that can occur while assembling or running the pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("watermark error: {0}")]
    Watermark(String),

    #[error("storage error: {0}")]
    Storage(String),
}
