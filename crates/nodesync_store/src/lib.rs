//! # nodesync Store
//!
//! Durable store capabilities and staging storage for nodesync.
//!
//! The engine shares state with other cluster members only through the
//! durable store. This crate describes that store as a set of capability
//! traits, one per entity, where every mutating method corresponds to a
//! single conditional row update.
//!
//! ## Design Principles
//!
//! - Compare-and-swap, never a held mutex: callers race and one wins per round
//! - A failed condition is reported as `false`, not as an error
//! - Inserting an existing key fails with [`StoreError::Duplicate`]
//!
//! ## Available Implementations
//!
//! - [`MemoryStore`] - all capabilities in one process, shared through `Arc`
//!   to simulate several servers on one database
//! - [`LocalStagingManager`] - staged payloads in memory, spilling to files
//!   above a size threshold

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod staging;

pub use backend::{
    DataStore, ExtractRequestStore, IncomingBatchStore, LockStore, NodeCommunicationStore,
    OutgoingBatchStore, SequenceStore,
};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use staging::{
    incoming_path, outgoing_path, LocalStagingManager, ResourceState, StagedResource,
    StagingManager,
};
