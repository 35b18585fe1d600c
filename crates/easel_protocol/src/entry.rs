//! History entries: one user-perceived step made of one or more records.

use crate::record::Record;
use serde::{Deserialize, Serialize};

/// A single undo/redo step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "records", rename_all = "lowercase")]
pub enum Entry {
    /// One record.
    Single(Record),
    /// Records applied in order as one atomic step.
    Batch(Vec<Record>),
}

impl Entry {
    /// Returns the records in application order.
    pub fn records(&self) -> &[Record] {
        match self {
            Entry::Single(record) => std::slice::from_ref(record),
            Entry::Batch(records) => records,
        }
    }

    /// Returns true if this is a batch entry.
    pub fn is_batch(&self) -> bool {
        matches!(self, Entry::Batch(_))
    }

    /// Returns the number of records in this entry.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Returns true if the entry holds no records.
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Returns true if any record in the entry must be broadcast.
    pub fn need_sync(&self) -> bool {
        self.records().iter().any(|r| r.need_sync)
    }

    /// Returns the inverse entry.
    ///
    /// A batch is reversed record by record and the resulting list is
    /// reversed too, so replaying it forward undoes the original in
    /// last-applied-first-undone order.
    pub fn reverse(&self) -> Self {
        match self {
            Entry::Single(record) => Entry::Single(record.reverse()),
            Entry::Batch(records) => Entry::Batch(records.iter().rev().map(Record::reverse).collect()),
        }
    }

    /// Compares two entries ignoring record IDs and timestamps.
    pub fn same_edit(&self, other: &Entry) -> bool {
        self.is_batch() == other.is_batch()
            && self.len() == other.len()
            && self
                .records()
                .iter()
                .zip(other.records())
                .all(|(a, b)| a.same_edit(b))
    }
}
