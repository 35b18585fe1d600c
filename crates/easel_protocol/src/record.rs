//! Undoable edit records.

use crate::error::{ProtocolError, ProtocolResult};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_RECORD_SEQ: AtomicU64 = AtomicU64::new(1);

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Locally unique record identifier (`<timestamp_ms>-<counter>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generates a fresh ID from the clock and a process-wide counter.
    pub fn generate() -> Self {
        let seq = NEXT_RECORD_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{}", now_millis(), seq))
    }

    /// Wraps an existing ID string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of edit a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Objects were created.
    Add,
    /// Objects were deleted.
    Remove,
    /// Objects were changed in place.
    Modify,
}

impl RecordKind {
    /// Returns the kind produced by reversing a record of this kind.
    pub fn reversed(&self) -> Self {
        match self {
            RecordKind::Add => RecordKind::Remove,
            RecordKind::Remove => RecordKind::Add,
            RecordKind::Modify => RecordKind::Modify,
        }
    }
}

/// One atomic edit against one or more objects owned by a single plugin.
///
/// # Shape
///
/// - `Add`: only `after` is present
/// - `Remove`: only `before` is present
/// - `Modify`: both are present
///
/// Every present snapshot list has one entry per `object_ids` element, in
/// the same order. [`Record::validate`] checks all of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record ID.
    pub id: RecordId,
    /// Edit kind.
    pub kind: RecordKind,
    /// Name of the plugin that applies this record.
    pub owner: String,
    /// Creation time in milliseconds.
    pub timestamp: u64,
    /// Affected object IDs.
    pub object_ids: Vec<String>,
    /// State before the edit (remove, modify).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<Snapshot>>,
    /// State after the edit (add, modify).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<Snapshot>>,
    /// Whether the record must be broadcast to other clients.
    pub need_sync: bool,
}

impl Record {
    /// Creates an `Add` record from the created objects' snapshots.
    pub fn add(owner: impl Into<String>, after: Vec<Snapshot>) -> Self {
        Self::unchecked(RecordKind::Add, owner.into(), ids_of(&after), None, Some(after))
    }

    /// Creates a `Remove` record from the deleted objects' snapshots.
    pub fn remove(owner: impl Into<String>, before: Vec<Snapshot>) -> Self {
        Self::unchecked(RecordKind::Remove, owner.into(), ids_of(&before), Some(before), None)
    }

    /// Creates a `Modify` record.
    ///
    /// Fails if `before` and `after` do not describe the same objects in the
    /// same order.
    pub fn modify(
        owner: impl Into<String>,
        before: Vec<Snapshot>,
        after: Vec<Snapshot>,
    ) -> ProtocolResult<Self> {
        let record = Self::unchecked(
            RecordKind::Modify,
            owner.into(),
            ids_of(&after),
            Some(before),
            Some(after),
        );
        record.validate()?;
        Ok(record)
    }

    /// Builds a record from explicit parts and validates its shape.
    pub fn from_parts(
        kind: RecordKind,
        owner: impl Into<String>,
        object_ids: Vec<String>,
        before: Option<Vec<Snapshot>>,
        after: Option<Vec<Snapshot>>,
    ) -> ProtocolResult<Self> {
        let record = Self::unchecked(kind, owner.into(), object_ids, before, after);
        record.validate()?;
        Ok(record)
    }

    fn unchecked(
        kind: RecordKind,
        owner: String,
        object_ids: Vec<String>,
        before: Option<Vec<Snapshot>>,
        after: Option<Vec<Snapshot>>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            kind,
            owner,
            timestamp: now_millis(),
            object_ids,
            before,
            after,
            need_sync: false,
        }
    }

    /// Sets whether the record must be broadcast.
    pub fn with_need_sync(mut self, need_sync: bool) -> Self {
        self.need_sync = need_sync;
        self
    }

    /// Checks the add/remove/modify shape rules.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.owner.is_empty() {
            return Err(ProtocolError::invalid_record("owner is empty"));
        }
        if self.object_ids.is_empty() {
            return Err(ProtocolError::invalid_record("record targets no objects"));
        }

        let (needs_before, needs_after) = match self.kind {
            RecordKind::Add => (false, true),
            RecordKind::Remove => (true, false),
            RecordKind::Modify => (true, true),
        };

        for (label, list, required) in [
            ("before", &self.before, needs_before),
            ("after", &self.after, needs_after),
        ] {
            match (list, required) {
                (Some(_), false) => {
                    return Err(ProtocolError::invalid_record(format!(
                        "{:?} record must not carry `{}`",
                        self.kind, label
                    )))
                }
                (None, true) => {
                    return Err(ProtocolError::invalid_record(format!(
                        "{:?} record requires `{}`",
                        self.kind, label
                    )))
                }
                (Some(snapshots), true) => self.check_alignment(label, snapshots)?,
                (None, false) => {}
            }
        }

        Ok(())
    }

    fn check_alignment(&self, label: &str, snapshots: &[Snapshot]) -> ProtocolResult<()> {
        if snapshots.len() != self.object_ids.len() {
            return Err(ProtocolError::invalid_record(format!(
                "`{}` has {} snapshots for {} objects",
                label,
                snapshots.len(),
                self.object_ids.len()
            )));
        }
        for (snapshot, id) in snapshots.iter().zip(&self.object_ids) {
            if &snapshot.id != id {
                return Err(ProtocolError::invalid_record(format!(
                    "`{}` snapshot {} does not match object {}",
                    label, snapshot.id, id
                )));
            }
        }
        Ok(())
    }

    /// Returns the inverse edit.
    ///
    /// Add becomes remove, remove becomes add, and modify swaps its
    /// snapshots. The result gets a fresh ID and timestamp; owner, object
    /// IDs and `need_sync` are carried over.
    pub fn reverse(&self) -> Self {
        let (before, after) = match self.kind {
            RecordKind::Add => (self.after.clone(), None),
            RecordKind::Remove => (None, self.before.clone()),
            RecordKind::Modify => (self.after.clone(), self.before.clone()),
        };

        Self {
            id: RecordId::generate(),
            kind: self.kind.reversed(),
            owner: self.owner.clone(),
            timestamp: now_millis(),
            object_ids: self.object_ids.clone(),
            before,
            after,
            need_sync: self.need_sync,
        }
    }

    /// Compares two records ignoring ID and timestamp.
    pub fn same_edit(&self, other: &Record) -> bool {
        self.kind == other.kind
            && self.owner == other.owner
            && self.object_ids == other.object_ids
            && self.before == other.before
            && self.after == other.after
            && self.need_sync == other.need_sync
    }
}

fn ids_of(snapshots: &[Snapshot]) -> Vec<String> {
    snapshots.iter().map(|s| s.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn snap(id: &str, x: i64) -> Snapshot {
        Snapshot::new(id, json!({ "x": x }))
    }

    #[test]
    fn record_ids_are_distinct() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn add_record_shape() {
        let record = Record::add("image", vec![snap("o1", 0)]);
        assert_eq!(record.kind, RecordKind::Add);
        assert_eq!(record.object_ids, vec!["o1".to_string()]);
        assert!(record.before.is_none());
        assert!(record.validate().is_ok());
        assert!(!record.need_sync);
    }

    #[test]
    fn modify_requires_matching_ids() {
        let err = Record::modify("image", vec![snap("o1", 0)], vec![snap("o2", 1)]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRecord(_)));

        let err = Record::modify("image", vec![snap("o1", 0)], vec![]).unwrap_err();
        assert!(err.to_string().contains("objects"));
    }

    #[test]
    fn from_parts_rejects_wrong_fields() {
        let result = Record::from_parts(
            RecordKind::Add,
            "marker",
            vec!["o1".into()],
            Some(vec![snap("o1", 0)]),
            Some(vec![snap("o1", 0)]),
        );
        assert!(result.is_err());

        let result = Record::from_parts(RecordKind::Remove, "marker", vec!["o1".into()], None, None);
        assert!(result.is_err());

        let result = Record::from_parts(RecordKind::Add, "", vec!["o1".into()], None, Some(vec![snap("o1", 0)]));
        assert!(result.is_err());
    }

    #[test]
    fn reverse_add_is_remove() {
        let record = Record::add("image", vec![snap("o1", 0)]).with_need_sync(true);
        let reversed = record.reverse();

        assert_eq!(reversed.kind, RecordKind::Remove);
        assert_eq!(reversed.before, record.after);
        assert!(reversed.after.is_none());
        assert!(reversed.need_sync);
        assert_ne!(reversed.id, record.id);
        assert!(reversed.validate().is_ok());
    }

    #[test]
    fn reverse_modify_swaps() {
        let record = Record::modify("region", vec![snap("o1", 0)], vec![snap("o1", 5)]).unwrap();
        let reversed = record.reverse();

        assert_eq!(reversed.kind, RecordKind::Modify);
        assert_eq!(reversed.before, record.after);
        assert_eq!(reversed.after, record.before);
        assert_eq!(reversed.object_ids, record.object_ids);
    }

    #[test]
    fn record_json_omits_absent_side() {
        let record = Record::add("image", vec![snap("o1", 0)]);
        let encoded = serde_json::to_value(&record).unwrap();
        assert!(encoded.get("before").is_none());
        assert_eq!(encoded["kind"], "add");

        let decoded: Record = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, record);
    }

    fn arb_snapshots(n: usize) -> impl Strategy<Value = Vec<Snapshot>> {
        proptest::collection::vec(any::<i64>(), n).prop_map(|xs| {
            xs.into_iter()
                .enumerate()
                .map(|(i, x)| snap(&format!("o{}", i), x))
                .collect()
        })
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        (1usize..4, any::<bool>(), 0u8..3).prop_flat_map(|(n, sync, kind)| {
            (arb_snapshots(n), arb_snapshots(n)).prop_map(move |(before, after)| {
                let record = match kind {
                    0 => Record::add("image", after),
                    1 => Record::remove("image", before),
                    _ => Record::modify("image", before, after).unwrap(),
                };
                record.with_need_sync(sync)
            })
        })
    }

    proptest! {
        #[test]
        fn reverse_is_an_involution(record in arb_record()) {
            let twice = record.reverse().reverse();
            prop_assert!(twice.same_edit(&record));
            prop_assert!(record.reverse().validate().is_ok());
        }
    }
}
