//! # nodesync Core
//!
//! Batch ledger and coordination services for nodesync.
//!
//! This crate provides:
//! - Sequence generator with compare-and-swap retries
//! - Cluster locks shared by every server on one database
//! - Node communication leases that schedule push, pull and extract work
//! - Outgoing and incoming batch ledgers
//! - Acknowledgment processing on the sending side
//! - Staging extraction, including multi-batch reload requests
//! - Payload loading with duplicate detection on the receiving side
//!
//! All coordination happens through conditional updates in the durable
//! store, so several servers may run these services against one database.
//!
//! ## Key Invariants
//!
//! - Sequence values are unique across every caller on one store
//! - At most one server holds an exclusive lock; shared holders are counted
//! - A batch that reached `OK` is never reloaded or rewritten by an ack
//! - An incoming batch is loaded at most once unless its last attempt failed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod cluster;
mod communication;
mod config;
mod error;
pub mod extract;
mod incoming;
mod loader;
mod node;
mod outgoing;
mod retry;
mod sequence;
mod services;

pub use ack::{AckResult, AckSummary, AcknowledgeService};
pub use cluster::{ClusterLockService, LockKind, LockOutcome};
pub use communication::{LeaseOutcome, NodeCommunicationService};
pub use config::{CoreConfig, ExtractConfig, LeaseConfig, LoadConfig, LockConfig, SequenceConfig};
pub use error::{CoreError, CoreResult};
pub use extract::{
    CaptureReader, DataExtractorService, DataWriter, MultiBatchStagingWriter, RowStream,
    StagingDataWriter, WriterStatistics,
};
pub use incoming::{Admission, IncomingBatchService};
pub use loader::{BatchApplier, DataLoaderService, LoadFailure, LoadFailureKind, LoadedBatch};
pub use node::{NodeDirectory, StaticNodeDirectory};
pub use outgoing::OutgoingBatchService;
pub use retry::{RetryDecision, RetryPolicy};
pub use sequence::SequenceService;
pub use services::{NodeServices, NodeServicesBuilder, Stores};
