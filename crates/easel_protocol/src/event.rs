//! Wire events exchanged through the sync transport.

use crate::entry::Entry;
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Record, RecordKind};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key inside `metadata` naming the plugin that owns an object.
const CATEGORY_KEY: &str = "category";

/// Type tag of a wire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// An object was created, changed or deleted by a client.
    #[serde(rename = "client:change")]
    ClientChange,
    /// The server asks clients to add images from URLs.
    #[serde(rename = "server:add_image")]
    ServerAddImage,
}

impl EventType {
    /// Returns the wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ClientChange => "client:change",
            EventType::ServerAddImage => "server:add_image",
        }
    }
}

/// Wire form of one document object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPayload {
    /// Object ID.
    pub id: String,
    /// Domain metadata, including `category`.
    #[serde(default)]
    pub metadata: Value,
    /// Transform and appearance.
    #[serde(default)]
    pub style: Value,
}

impl ObjectPayload {
    /// Builds the wire form of a snapshot owned by `owner`.
    ///
    /// `metadata.category` is set to the owner name.
    pub fn from_snapshot(owner: &str, snapshot: &Snapshot) -> Self {
        let mut metadata = match snapshot.metadata() {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        metadata.insert(CATEGORY_KEY.into(), Value::String(owner.to_string()));

        Self {
            id: snapshot.id.clone(),
            metadata: Value::Object(metadata),
            style: snapshot.style().cloned().unwrap_or(Value::Null),
        }
    }

    /// Returns the owning plugin name, if present.
    pub fn category(&self) -> Option<&str> {
        self.metadata.get(CATEGORY_KEY).and_then(Value::as_str)
    }

    /// Returns the owning plugin name or a malformed-event error.
    pub fn require_category(&self) -> ProtocolResult<&str> {
        self.category()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProtocolError::malformed(format!("object {} has no category", self.id)))
    }

    /// Converts back into a snapshot.
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot::from_parts(self.id.clone(), self.metadata.clone(), self.style.clone())
    }
}

/// Payload of a `client:change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Object ID.
    pub id: String,
    /// Domain metadata, including `category`.
    #[serde(default)]
    pub metadata: Value,
    /// Transform and appearance.
    #[serde(default)]
    pub style: Value,
    /// Client that produced the change.
    pub client_id: String,
    /// Whether the object was deleted.
    #[serde(default)]
    pub is_delete: bool,
}

impl EventData {
    /// Creates event data for one object.
    pub fn new(object: ObjectPayload, client_id: impl Into<String>, is_delete: bool) -> Self {
        Self {
            id: object.id,
            metadata: object.metadata,
            style: object.style,
            client_id: client_id.into(),
            is_delete,
        }
    }

    /// Serializes a record into one event per affected object.
    ///
    /// Removals carry the `before` snapshots with `is_delete = true`; adds
    /// and modifications carry the `after` snapshots.
    pub fn from_record(record: &Record, client_id: &str) -> Vec<Self> {
        let (snapshots, is_delete) = match record.kind {
            RecordKind::Remove => (record.before.as_deref(), true),
            RecordKind::Add | RecordKind::Modify => (record.after.as_deref(), false),
        };

        snapshots
            .unwrap_or_default()
            .iter()
            .map(|s| Self::new(ObjectPayload::from_snapshot(&record.owner, s), client_id, is_delete))
            .collect()
    }

    /// Returns the object part of the event.
    pub fn object(&self) -> ObjectPayload {
        ObjectPayload {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            style: self.style.clone(),
        }
    }

    /// Converts the event into a record to apply locally.
    ///
    /// `current` is the local snapshot of the object if this client already
    /// knows it: deletions become `Remove`, known objects become `Modify`
    /// and unknown objects become `Add`. The record never needs sync.
    pub fn to_record(&self, current: Option<Snapshot>) -> ProtocolResult<Record> {
        let object = self.object();
        let owner = object.require_category()?.to_string();
        let incoming = object.to_snapshot();

        let record = if self.is_delete {
            Record::remove(owner, vec![incoming])
        } else if let Some(current) = current {
            Record::modify(owner, vec![current], vec![incoming])?
        } else {
            Record::add(owner, vec![incoming])
        };
        Ok(record)
    }
}

/// Payload of a `server:add_image` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddImageData {
    /// Image URLs to add.
    pub urls: Vec<String>,
}

/// Decoded event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// A client change.
    ClientChange(EventData),
    /// A server image injection.
    AddImage(AddImageData),
}

impl EventPayload {
    /// Returns the originating client, if the event came from one.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            EventPayload::ClientChange(data) => Some(&data.client_id),
            EventPayload::AddImage(_) => None,
        }
    }
}

/// An event as pushed by a client, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Event ID.
    pub id: String,
    /// Event type.
    pub event_type: EventType,
    /// Type-specific payload.
    pub event_data: Value,
}

impl OutboundEvent {
    /// Creates a `client:change` event.
    pub fn client_change(id: impl Into<String>, data: &EventData) -> ProtocolResult<Self> {
        Ok(Self {
            id: id.into(),
            event_type: EventType::ClientChange,
            event_data: serde_json::to_value(data)?,
        })
    }

    /// Creates a `server:add_image` event.
    pub fn add_image(id: impl Into<String>, urls: Vec<String>) -> ProtocolResult<Self> {
        Ok(Self {
            id: id.into(),
            event_type: EventType::ServerAddImage,
            event_data: serde_json::to_value(AddImageData { urls })?,
        })
    }

    /// Serializes every record of an entry, in entry order.
    pub fn from_entry(entry: &Entry, client_id: &str) -> ProtocolResult<Vec<Self>> {
        let mut events = Vec::new();
        for record in entry.records() {
            for (index, data) in EventData::from_record(record, client_id).iter().enumerate() {
                events.push(Self::client_change(format!("{}/{}", record.id, index), data)?);
            }
        }
        Ok(events)
    }

    /// Decodes the typed payload.
    pub fn decode(&self) -> ProtocolResult<EventPayload> {
        decode_payload(self.event_type, &self.event_data)
    }
}

/// An event with its transport-assigned sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    /// Global sequence number.
    pub sequence_id: u64,
    /// Event type.
    pub event_type: EventType,
    /// Type-specific payload.
    pub event_data: Value,
}

impl SequencedEvent {
    /// Assigns a sequence number to an outbound event.
    pub fn from_outbound(sequence_id: u64, event: OutboundEvent) -> Self {
        Self {
            sequence_id,
            event_type: event.event_type,
            event_data: event.event_data,
        }
    }

    /// Decodes the typed payload.
    pub fn decode(&self) -> ProtocolResult<EventPayload> {
        decode_payload(self.event_type, &self.event_data)
    }
}

fn decode_payload(event_type: EventType, data: &Value) -> ProtocolResult<EventPayload> {
    match event_type {
        EventType::ClientChange => {
            let data: EventData = serde_json::from_value(data.clone())?;
            if data.id.is_empty() {
                return Err(ProtocolError::malformed("client:change without object id"));
            }
            data.object().require_category()?;
            Ok(EventPayload::ClientChange(data))
        }
        EventType::ServerAddImage => {
            Ok(EventPayload::AddImage(serde_json::from_value(data.clone())?))
        }
    }
}
