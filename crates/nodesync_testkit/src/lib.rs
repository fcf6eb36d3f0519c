//! # nodesync Testkit
//!
//! Test utilities for nodesync.
//!
//! This crate provides:
//! - Capture sources and batch appliers that record what they see
//! - `TestNode`, a fully wired node over an in-memory store and manual clock
//! - Property-based test generators using proptest
//! - Logging setup for test binaries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nodesync_testkit::prelude::*;
//!
//! #[test]
//! fn extracts_routed_rows() {
//!     let (sender, receiver) = TestNode::pair("N1", "N2");
//!     let batch = sender.route_batch("N2", "default", 3);
//!     // ... push, pull or extract
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

#[cfg(test)]
mod properties;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
