//! # Easel Engine
//!
//! Undo/redo history and multi-client synchronization for Easel documents.
//!
//! This crate provides:
//! - History manager (batched, nestable undo/redo with eviction)
//! - Plugin registry and the record applier contract
//! - Sync session (push, echo suppression, sequence dedup, full resync)
//! - Transport abstraction with HTTP, loopback and mock implementations
//!
//! ## Architecture
//!
//! A plugin performs a user edit and records it through the
//! [`HistoryManager`]. Sync-worthy entries are queued and pushed by the
//! [`SyncSession`], which also receives other clients' events and replays
//! them through the same plugin dispatch used by redo.
//!
//! ## Key Invariants
//!
//! - Recording is paused while undo, redo or remote events are replayed
//! - Batches undo in reverse order and redo in original order
//! - A client never applies its own broadcast events
//! - An event is applied at most once (sequence dedup)
//! - Applying a remote event clears the local history

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod history;
mod http;
mod memory;
mod plugin;
mod session;
mod transport;

pub use config::{HistoryConfig, RetryConfig, SyncConfig};
pub use error::{ApplyError, ApplyResult, HistoryError, HistoryResult, SyncError, SyncResult};
pub use history::{
    AddOutcome, BatchEnd, BatchGuard, HistoryEvent, HistoryManager, HistoryStats, ListenerId,
    PauseGuard, SelectionSink,
};
pub use http::{HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer, SseDecoder};
pub use memory::{HostCall, MemoryObjectHost, MemoryPlugin};
pub use plugin::{
    apply_in_direction, apply_with_host, ApplyDirection, HostApplier, ObjectHost, PluginRegistry,
    RecordApplier,
};
pub use session::{
    EventOutcome, FlushReport, InjectionHandler, SessionState, SyncSession, SyncStats,
};
pub use transport::{LiveChannel, MockTransport, SyncTransport};
