//! Error types for the receiving endpoint.

use nodesync_core::CoreError;
use nodesync_engine::EngineError;
use nodesync_protocol::{ProtocolError, RemoteError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a remote node.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Every session slot is taken.
    #[error("too many sessions: {active} of {max} in use")]
    Busy {
        /// Sessions held.
        active: usize,
        /// Configured limit.
        max: usize,
    },

    /// The channel is disabled on this node.
    #[error("channel disabled: {0}")]
    ChannelDisabled(String),

    /// The caller is unknown, disabled or presented a bad token.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The caller's token is older than the configured expiry.
    #[error("token of {0} expired")]
    AuthenticationExpired(String),

    /// The request does not match a live reservation.
    #[error("invalid reservation: {0}")]
    InvalidReservation(String),

    /// Core service failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Pipeline failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Malformed payload.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the caller caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::Busy { .. }
                | ServerError::ChannelDisabled(_)
                | ServerError::NotAuthorized(_)
                | ServerError::AuthenticationExpired(_)
                | ServerError::InvalidReservation(_)
                | ServerError::Protocol(_)
        )
    }

    /// Returns true if this node failed.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// The typed failure reported back to the caller.
    pub fn into_remote(self) -> RemoteError {
        match self {
            ServerError::Busy { .. } => RemoteError::ServiceUnavailable,
            ServerError::ChannelDisabled(channel) => RemoteError::ChannelDisabled(channel),
            ServerError::AuthenticationExpired(_) => RemoteError::AuthenticationExpired,
            ServerError::NotAuthorized(_) | ServerError::InvalidReservation(_) => {
                RemoteError::ConnectionRejected
            }
            other => RemoteError::Internal(other.to_string()),
        }
    }
}
