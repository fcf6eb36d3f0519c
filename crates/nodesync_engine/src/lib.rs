//! # nodesync Engine
//!
//! Push/pull pipeline for nodesync.
//!
//! This crate provides:
//! - `NodeEngine` with `push`, `pull`, `ack` and `acquire_incoming_batch`
//! - A dispatcher that runs one worker per (node, channel) lease, throttled
//!   per communication type
//! - Push sessions split into an extract stage and a transport stage joined
//!   by a bounded queue
//! - Pull sessions that repeat while the remote keeps returning batches
//! - Transport abstraction with mock and in-process loopback implementations
//! - Offline detection per remote node
//!
//! ## Architecture
//!
//! A push cycle for one pair:
//! 1. Reserve a session on the remote (rejection means "try next cycle")
//! 2. Reconcile batches left in flight by asking the remote for their status
//! 3. Stage pending batches on a blocking thread, handing each over a
//!    bounded channel ended by a sentinel
//! 4. Send the staged batches in one request and apply the returned acks
//!
//! ## Key Invariants
//!
//! - At most one worker per (node, channel, type) across the cluster
//! - Batches of one session are sent in ascending batch id order
//! - Remote rejections are outcomes, never errors

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dispatch;
mod engine;
mod error;
mod loopback;
mod offline;
mod pipeline;
mod pull;
mod push;
mod status;
mod transport;

pub use config::{EngineConfig, PullConfig, PushConfig};
pub use dispatch::CommunicationDispatcher;
pub use engine::NodeEngine;
pub use error::{EngineError, EngineResult};
pub use loopback::{LoopbackServer, LoopbackTransport};
pub use offline::TransportErrorTracker;
pub use pipeline::{ignored_marker, stage_batches, StagedBatch, StagedItem};
pub use pull::PullService;
pub use push::PushService;
pub use status::{RemoteNodeStatus, RemoteNodeStatuses, RemoteStatus};
pub use transport::{MockTransport, PushSession, RecordedRequest, TransportManager};
