//! Transport request, response and push-channel messages.

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{ObjectPayload, OutboundEvent, SequencedEvent};
use serde::{Deserialize, Serialize};

/// Authoritative document state returned by the full-state endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullState {
    /// Last uploaded document, if any client uploaded one.
    #[serde(default)]
    pub document: Option<Vec<ObjectPayload>>,
    /// Current global sequence number.
    pub sequence_id: u64,
    /// Events recorded since the document was uploaded.
    #[serde(default)]
    pub trailing_events: Vec<SequencedEvent>,
}

impl FullState {
    /// Returns the trailing events sorted by sequence number.
    pub fn sorted_trailing_events(&self) -> Vec<SequencedEvent> {
        let mut events = self.trailing_events.clone();
        events.sort_by_key(|e| e.sequence_id);
        events
    }
}

/// Request body of the push-event endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEventRequest {
    /// Events in the order they were produced.
    pub events: Vec<OutboundEvent>,
}

impl PushEventRequest {
    /// Creates a new push request.
    pub fn new(events: Vec<OutboundEvent>) -> Self {
        Self { events }
    }
}

/// Response of the push-event endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEventResponse {
    /// Sequence number assigned to the last event of the request.
    pub sequence_id: u64,
    /// Number of events logged since the last full upload.
    pub queue_length: usize,
}

/// Request body of the full-upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSyncRequest {
    /// Uploading client.
    pub client_id: String,
    /// Last sequence the client had applied when it took the snapshot.
    ///
    /// The server refuses the upload if newer events exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sequence_id: Option<u64>,
    /// Complete document.
    pub document: Vec<ObjectPayload>,
}

/// Response of the full-upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncResponse {
    /// Whether the document was stored.
    pub success: bool,
    /// Sequence number the document corresponds to.
    pub sequence_id: u64,
}

/// A message delivered on a client's push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The channel is open.
    Connected {
        /// The subscribed client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    /// A sequenced event.
    SyncEvent {
        /// The event.
        data: SequencedEvent,
    },
}

impl ServerMessage {
    /// Encodes the message as a JSON text frame.
    pub fn to_frame(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_frame(frame: &str) -> ProtocolResult<Self> {
        let trimmed = frame.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::malformed("empty frame"));
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[test]
    fn parse_connected_frame() {
        let message = ServerMessage::from_frame(r#"{"type":"connected","client_id":"c1"}"#).unwrap();
        assert_eq!(
            message,
            ServerMessage::Connected {
                client_id: Some("c1".into())
            }
        );

        let bare = ServerMessage::from_frame(r#"{"type":"connected"}"#).unwrap();
        assert_eq!(bare, ServerMessage::Connected { client_id: None });
    }

    #[test]
    fn parse_sync_event_frame() {
        let frame = json!({
            "type": "sync_event",
            "data": {
                "sequence_id": 12,
                "event_type": "client:change",
                "event_data": { "id": "o1", "client_id": "c2" }
            }
        })
        .to_string();

        match ServerMessage::from_frame(&frame).unwrap() {
            ServerMessage::SyncEvent { data } => {
                assert_eq!(data.sequence_id, 12);
                assert_eq!(data.event_type, EventType::ClientChange);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(ServerMessage::from_frame("").is_err());
        assert!(ServerMessage::from_frame("not json").is_err());
        assert!(ServerMessage::from_frame(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn full_state_defaults() {
        let state: FullState = serde_json::from_value(json!({ "document": null, "sequence_id": 3 })).unwrap();
        assert!(state.document.is_none());
        assert!(state.trailing_events.is_empty());
        assert_eq!(state.sequence_id, 3);
    }

    #[test]
    fn trailing_events_sorted() {
        let event = |seq| SequencedEvent {
            sequence_id: seq,
            event_type: EventType::ServerAddImage,
            event_data: json!({ "urls": [] }),
        };
        let state = FullState {
            document: None,
            sequence_id: 9,
            trailing_events: vec![event(8), event(6), event(7)],
        };
        let seqs: Vec<u64> = state.sorted_trailing_events().iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![6, 7, 8]);
    }
}
