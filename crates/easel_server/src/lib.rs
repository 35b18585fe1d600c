//! # Easel Sync Hub
//!
//! In-memory sync hub for Easel documents.
//!
//! This crate provides:
//! - A global event log with strictly increasing sequence numbers
//! - Broadcast of every accepted event to every subscribed client
//! - Full-state snapshots (document + trailing events) for late joiners
//! - Full document upload, which truncates the log
//! - Debug endpoints (status, reset, image injection)
//!
//! # Architecture
//!
//! The hub is transport-agnostic. [`SyncHub`] exposes typed methods and a
//! path-based `handle_get` / `handle_post` pair that an HTTP layer (or a
//! loopback client in tests) can route to. Push channels are unbounded
//! channels of JSON frames; an HTTP layer wraps them in server-sent events.
//!
//! # Protocol
//!
//! 1. Client subscribes and receives a `connected` frame
//! 2. Client fetches the full state and replays the trailing events
//! 3. Client pushes events; each one is sequenced and broadcast
//! 4. Client occasionally uploads the whole document to compact the log

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod channels;
mod config;
mod error;
mod event_log;
mod handler;
mod server;

pub use channels::ClientChannels;
pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use event_log::EventLog;
pub use handler::{HandlerContext, HubStatus, RequestHandler};
pub use server::SyncHub;
