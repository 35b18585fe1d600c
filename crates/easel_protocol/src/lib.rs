//! # Easel Protocol
//!
//! Data types shared by the Easel history manager, sync session and hub.
//!
//! This crate provides:
//! - `Snapshot` for the state of one document object
//! - `Record` / `Entry` for undoable edits and their grouping
//! - Record and entry reversal
//! - Wire events and transport messages (JSON)
//! - HTTP endpoint paths
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod endpoint;
mod entry;
mod error;
mod event;
mod messages;
mod record;
mod snapshot;

pub use entry::Entry;
pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    AddImageData, EventData, EventPayload, EventType, ObjectPayload, OutboundEvent,
    SequencedEvent,
};
pub use messages::{
    FullState, FullSyncRequest, FullSyncResponse, PushEventRequest, PushEventResponse,
    ServerMessage,
};
pub use record::{now_millis, Record, RecordId, RecordKind};
pub use snapshot::Snapshot;
