//! Hub-side event log.

use crate::error::{HubError, HubResult};
use easel_protocol::{FullState, ObjectPayload, OutboundEvent, SequencedEvent};
use parking_lot::RwLock;

/// Global event log.
///
/// The log maintains:
/// - The last assigned sequence number (0 before the first event)
/// - Events accepted since the last full upload, in sequence order
/// - The last uploaded document, if any
///
/// Sequence numbers are never reused, even across uploads. Only
/// [`EventLog::reset`] starts them again from zero.
pub struct EventLog {
    state: RwLock<LogState>,
}

#[derive(Default)]
struct LogState {
    sequence_id: u64,
    events: Vec<SequencedEvent>,
    document: Option<Vec<ObjectPayload>>,
}

impl EventLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
        }
    }

    /// Returns the last assigned sequence number.
    pub fn sequence_id(&self) -> u64 {
        self.state.read().sequence_id
    }

    /// Returns the number of events since the last upload.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Returns true if no events were logged since the last upload.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }

    /// Returns true if a document was uploaded.
    pub fn has_document(&self) -> bool {
        self.state.read().document.is_some()
    }

    /// Returns the number of objects in the stored document.
    pub fn document_len(&self) -> usize {
        self.state.read().document.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Sequences and stores events, one number per event.
    ///
    /// Returns the sequenced events in order.
    pub fn append(&self, events: Vec<OutboundEvent>) -> Vec<SequencedEvent> {
        let mut state = self.state.write();
        let mut sequenced = Vec::with_capacity(events.len());
        for event in events {
            state.sequence_id += 1;
            sequenced.push(SequencedEvent::from_outbound(state.sequence_id, event));
        }
        state.events.extend(sequenced.iter().cloned());
        sequenced
    }

    /// Returns the document, sequence number and trailing events.
    pub fn full_state(&self) -> FullState {
        let state = self.state.read();
        FullState {
            document: state.document.clone(),
            sequence_id: state.sequence_id,
            trailing_events: state.events.clone(),
        }
    }

    /// Returns the events with a sequence number above `sequence_id`.
    pub fn events_since(&self, sequence_id: u64) -> Vec<SequencedEvent> {
        self.state
            .read()
            .events
            .iter()
            .filter(|e| e.sequence_id > sequence_id)
            .cloned()
            .collect()
    }

    /// Returns the last `count` events.
    pub fn recent(&self, count: usize) -> Vec<SequencedEvent> {
        let state = self.state.read();
        let start = state.events.len().saturating_sub(count);
        state.events[start..].to_vec()
    }

    /// Stores a full document and drops the logged events.
    ///
    /// If `base` is given and older than the current sequence, the upload
    /// is refused: the document would miss newer events.
    pub fn replace_document(&self, document: Vec<ObjectPayload>, base: Option<u64>) -> HubResult<u64> {
        let mut state = self.state.write();
        if let Some(base) = base {
            if base < state.sequence_id {
                return Err(HubError::StaleUpload {
                    base,
                    current: state.sequence_id,
                });
            }
        }
        state.document = Some(document);
        state.events.clear();
        Ok(state.sequence_id)
    }

    /// Drops everything and restarts numbering from zero.
    pub fn reset(&self) {
        *self.state.write() = LogState::default();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events(n: usize) -> Vec<OutboundEvent> {
        (0..n)
            .map(|i| OutboundEvent::add_image(format!("e{}", i), vec![format!("u{}", i)]).unwrap())
            .collect()
    }

    fn object(id: &str) -> ObjectPayload {
        ObjectPayload {
            id: id.into(),
            metadata: json!({ "category": "image" }),
            style: json!({}),
        }
    }

    #[test]
    fn empty_log() {
        let log = EventLog::new();
        assert_eq!(log.sequence_id(), 0);
        assert!(log.is_empty());
        assert!(!log.has_document());
        assert!(log.full_state().document.is_none());
    }

    #[test]
    fn append_assigns_consecutive_sequences() {
        let log = EventLog::new();
        let first = log.append(events(2));
        let second = log.append(events(3));

        let seqs: Vec<u64> = first.iter().chain(&second).map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.sequence_id(), 5);
        assert_eq!(log.len(), 5);
        assert_eq!(log.events_since(3).len(), 2);
        assert_eq!(log.recent(2)[0].sequence_id, 4);
        assert_eq!(log.recent(100).len(), 5);
    }

    #[test]
    fn upload_truncates_log_but_keeps_numbering() {
        let log = EventLog::new();
        log.append(events(3));

        assert_eq!(log.replace_document(vec![object("a")], Some(3)).unwrap(), 3);
        assert!(log.is_empty());
        assert_eq!(log.document_len(), 1);

        let next = log.append(events(1));
        assert_eq!(next[0].sequence_id, 4);

        let full = log.full_state();
        assert_eq!(full.sequence_id, 4);
        assert_eq!(full.trailing_events.len(), 1);
    }

    #[test]
    fn stale_upload_is_refused() {
        let log = EventLog::new();
        log.append(events(3));

        let err = log.replace_document(vec![object("a")], Some(2)).unwrap_err();
        assert!(matches!(err, HubError::StaleUpload { base: 2, current: 3 }));
        assert!(!log.has_document());
        assert_eq!(log.len(), 3);

        // Without a base the upload is unconditional.
        assert!(log.replace_document(vec![], None).is_ok());
    }

    #[test]
    fn reset_restarts_numbering() {
        let log = EventLog::new();
        log.append(events(2));
        log.replace_document(vec![object("a")], None).unwrap();
        log.reset();

        assert_eq!(log.sequence_id(), 0);
        assert!(!log.has_document());
        assert_eq!(log.append(events(1))[0].sequence_id, 1);
    }
}
