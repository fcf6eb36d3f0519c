//! # nodesync Protocol
//!
//! Data model and text codecs for the nodesync batch replication engine.
//!
//! This crate provides:
//! - `Batch` and `BatchStatus`, the ledger row shared by outgoing and incoming batches
//! - `BatchAck` and the line-oriented acknowledgment codec
//! - `ClusterLock`, `NodeCommunication`, `Sequence` and `ExtractRequest` rows
//! - Staged payload frames (one JSON object per line)
//! - Request/response messages exchanged between nodes
//! - `Timestamp` and the `Clock` abstraction
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - `(batch_id, node_id)` identifies a batch; ids are never reused
//! - A batch in `OK` is never rewritten except to clear its error flag
//! - `shared_count > 0` implies the lock is of type `Shared`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod batch;
mod communication;
mod error;
mod extract;
mod frame;
mod lock;
mod messages;
mod node;
mod sequence;
mod time;

pub use ack::{encode_acks, parse_acks, BatchAck, ParsedAcks};
pub use batch::{
    is_benign_sql_state, Batch, BatchId, BatchStatus, CONFLICT_STATE, DEADLOCK_STATE,
    FK_VIOLATION_STATE,
};
pub use communication::{CommunicationKey, CommunicationType, NodeCommunication};
pub use error::{ProtocolError, ProtocolResult};
pub use extract::{ExtractRequest, ExtractStatus};
pub use frame::{decode_payload, renumber_payload, BatchPayload, CaptureRow, DataEventType, Frame};
pub use lock::{actions, ClusterLock, LockMode, LockType, STOPPED_SERVER_ID};
pub use messages::{
    AckRequest, AckResponse, BatchStatusRequest, PullRequest, PullResponse, PushRequest,
    RemoteError, ReservationRequest, ReservationResponse,
};
pub use node::Node;
pub use sequence::{sequences, Sequence};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
