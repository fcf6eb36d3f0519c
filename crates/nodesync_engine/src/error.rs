//! Error types for the push/pull pipeline.

use nodesync_core::CoreError;
use nodesync_protocol::{ProtocolError, RemoteError};
use nodesync_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while moving batches between nodes.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Ledger, lock or staging failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The remote rejected or failed the request.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A payload or ack stream could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Staging failure outside a ledger operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The node directory does not know the node.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A pipeline task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Returns true for "try again next cycle" outcomes.
    pub fn is_rejection(&self) -> bool {
        matches!(self, EngineError::Remote(err) if err.is_rejection())
    }

    /// Returns true if the remote could not be reached or failed.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            EngineError::Remote(RemoteError::Unreachable(_) | RemoteError::Internal(_))
        )
    }

    /// Returns true if an extraction was cancelled by an operator.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Core(err) if err.is_cancellation())
    }

    /// Returns true if retrying later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Core(err) => err.is_retryable(),
            EngineError::Remote(_) => true,
            EngineError::Store(StoreError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::from(RemoteError::ServiceUnavailable).is_rejection());
        assert!(!EngineError::from(RemoteError::ServiceUnavailable).is_offline());
        assert!(EngineError::from(RemoteError::Unreachable("refused".into())).is_offline());
        assert!(EngineError::from(RemoteError::Unreachable("refused".into())).is_retryable());
        assert!(!EngineError::UnknownNode("N9".into()).is_retryable());
    }

    #[test]
    fn cancellation() {
        let err = EngineError::from(CoreError::Cancelled {
            batch_id: 7,
            node_id: "N2".into(),
        });
        assert!(err.is_cancellation());
        assert!(!err.is_rejection());
    }

    #[test]
    fn error_display() {
        let err = EngineError::UnknownNode("N9".into());
        assert_eq!(err.to_string(), "unknown node: N9");
    }
}
