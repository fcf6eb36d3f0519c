//! Error types for the core services.

use nodesync_protocol::{BatchId, ProtocolError};
use nodesync_store::StoreError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the core services.
///
/// Busy locks, held leases and duplicate deliveries are not errors; they
/// are reported through return values.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Durable or staging store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Payload or ack decoding failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The sequence could not be advanced before the retry timeout.
    #[error("timed out after {elapsed_ms}ms advancing sequence {name}")]
    SequenceTimeout {
        /// Sequence name.
        name: String,
        /// Time spent retrying.
        elapsed_ms: u64,
    },

    /// A non-cycling sequence reached its bound.
    #[error("sequence {0} is exhausted")]
    SequenceExhausted(String),

    /// The sequence row does not exist.
    #[error("sequence {0} does not exist")]
    SequenceNotFound(String),

    /// A ledger row the operation relies on is missing.
    #[error("batch {node_id}-{batch_id} not found")]
    BatchNotFound {
        /// Batch id.
        batch_id: BatchId,
        /// Node id.
        node_id: String,
    },

    /// Attempted to rewrite a batch that already reached `OK`.
    #[error("batch {node_id}-{batch_id} is already OK")]
    BatchFinalized {
        /// Batch id.
        batch_id: BatchId,
        /// Node id.
        node_id: String,
    },

    /// Extraction stopped because an operator resolved the batch mid-stream.
    #[error("extraction of batch {node_id}-{batch_id} was cancelled")]
    Cancelled {
        /// Batch id.
        batch_id: BatchId,
        /// Node id.
        node_id: String,
    },

    /// The staged payload of a batch is missing.
    #[error("staged resource {0} is missing")]
    StagedResourceMissing(String),

    /// The capture reader failed.
    #[error("capture error: {0}")]
    Capture(String),

    /// An argument violated a contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    /// Returns true for configuration errors that no retry can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::SequenceExhausted(_)
                | CoreError::SequenceNotFound(_)
                | CoreError::InvalidArgument(_)
        )
    }

    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::SequenceTimeout { .. } | CoreError::Store(StoreError::Unavailable(_))
        )
    }

    /// Returns true for a cancelled extraction.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CoreError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CoreError::SequenceExhausted("s".into()).is_fatal());
        assert!(!CoreError::SequenceExhausted("s".into()).is_retryable());
        let timeout = CoreError::SequenceTimeout {
            name: "s".into(),
            elapsed_ms: 5000,
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());
        assert!(CoreError::Store(StoreError::Unavailable("down".into())).is_retryable());
        assert!(CoreError::Cancelled {
            batch_id: 1,
            node_id: "N2".into()
        }
        .is_cancellation());
    }

    #[test]
    fn error_display() {
        let err = CoreError::BatchNotFound {
            batch_id: 1001,
            node_id: "N1".into(),
        };
        assert_eq!(err.to_string(), "batch N1-1001 not found");
    }
}
