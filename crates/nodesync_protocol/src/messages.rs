//! Messages exchanged between a node and a remote node.

use crate::batch::BatchId;
use crate::communication::CommunicationType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed rejection or failure reported by a remote node.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The remote is too busy to take another session.
    #[error("service unavailable")]
    ServiceUnavailable,

    /// The remote refused the caller.
    #[error("connection rejected")]
    ConnectionRejected,

    /// The channel is disabled on the remote.
    #[error("channel disabled: {0}")]
    ChannelDisabled(String),

    /// The caller's credential expired.
    #[error("authentication expired")]
    AuthenticationExpired,

    /// The remote could not be reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The remote failed while handling the request.
    #[error("remote failure: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Returns true for "try again next cycle" outcomes.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RemoteError::ServiceUnavailable
                | RemoteError::ConnectionRejected
                | RemoteError::ChannelDisabled(_)
                | RemoteError::AuthenticationExpired
        )
    }
}

/// Asks the remote to reserve a session before data moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// Calling node.
    pub node_id: String,
    /// Caller credential.
    pub security_token: Vec<u8>,
    /// Channel the session is for.
    pub channel_id: String,
    /// Kind of session.
    pub communication_type: CommunicationType,
}

/// A granted reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationResponse {
    /// Id to present with the data request.
    pub reservation_id: String,
}

/// Pushes staged batches to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Reservation obtained beforehand.
    pub reservation_id: String,
    /// Calling node.
    pub node_id: String,
    /// Caller credential.
    pub security_token: Vec<u8>,
    /// Concatenated staged batches.
    pub payload: Vec<u8>,
}

/// Ack stream plus extended ack stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// One line per batch.
    pub acks: String,
    /// Statistics and diagnostics per batch.
    pub extended: String,
}

/// Asks the remote to extract and return batches for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Reservation obtained beforehand.
    pub reservation_id: String,
    /// Calling node.
    pub node_id: String,
    /// Caller credential.
    pub security_token: Vec<u8>,
    /// Channel to pull.
    pub channel_id: String,
}

/// Batches returned by a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Concatenated staged batches.
    pub payload: Vec<u8>,
    /// Number of batches in the payload.
    pub batch_count: usize,
}

/// Reports load outcomes of pulled batches back to their sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    /// Calling node.
    pub node_id: String,
    /// Caller credential.
    pub security_token: Vec<u8>,
    /// The acks.
    pub acks: AckResponse,
}

/// Asks the remote for its ledger view of batches it was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatusRequest {
    /// Calling node.
    pub node_id: String,
    /// Caller credential.
    pub security_token: Vec<u8>,
    /// Batches to look up.
    pub batch_ids: Vec<BatchId>,
}
