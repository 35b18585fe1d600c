//! Object snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The complete state needed to recreate or restore one document object.
///
/// `id` is stable for the lifetime of the object and is shared by every
/// client. `data` is owned by the plugin that manages the object. Objects
/// that are synchronized keep their wire-visible state under the `metadata`
/// and `style` keys of `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Object ID.
    pub id: String,
    /// Plugin-defined payload.
    pub data: Value,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Creates a snapshot from separate metadata and style values.
    pub fn from_parts(id: impl Into<String>, metadata: Value, style: Value) -> Self {
        let mut data = Map::new();
        data.insert("metadata".into(), metadata);
        data.insert("style".into(), style);
        Self::new(id, Value::Object(data))
    }

    /// Returns the `metadata` part of the payload, if any.
    pub fn metadata(&self) -> Option<&Value> {
        self.data.get("metadata")
    }

    /// Returns the `style` part of the payload, if any.
    pub fn style(&self) -> Option<&Value> {
        self.data.get("style")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_accessors() {
        let snapshot = Snapshot::from_parts("o1", json!({"label": "a"}), json!({"left": 4}));
        assert_eq!(snapshot.id, "o1");
        assert_eq!(snapshot.metadata(), Some(&json!({"label": "a"})));
        assert_eq!(snapshot.style(), Some(&json!({"left": 4})));
    }

    #[test]
    fn opaque_payload_has_no_parts() {
        let snapshot = Snapshot::new("o2", json!({"x": 0}));
        assert!(snapshot.metadata().is_none());
        assert!(snapshot.style().is_none());
    }
}
