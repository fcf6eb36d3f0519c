//! # nodesync Server
//!
//! The receiving endpoint of a node.
//!
//! This crate provides:
//! - A reservation handshake that caps concurrent sessions
//! - Push intake: pushed batches are loaded and answered with acks
//! - Pull serving: pending batches are staged for the caller
//! - Ack intake and batch status queries
//! - HMAC-SHA256 node tokens
//!
//! # Protocol
//!
//! Every data exchange is preceded by a reservation:
//! 1. The caller reserves a session for one channel and direction
//! 2. It pushes or pulls with the reservation id
//! 3. A puller sends its acks back once the batches are loaded
//! 4. A pusher that lost a response asks for the status of the batches
//!    it left in flight before sending them again
//!
//! # Authentication
//!
//! ```rust,ignore
//! use nodesync_server::{AuthConfig, ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(AuthConfig::new(secret));
//! let server = SyncServer::new(config, services);
//! let token = server.context().validator().unwrap().create_token("N1")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, InboundPush, RequestHandler};
pub use server::SyncServer;
