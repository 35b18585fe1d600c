//! Undo/redo history.
//!
//! The [`HistoryManager`] keeps a bounded stack of [`Entry`] values and a
//! cursor. Entries below the cursor can be undone; entries at or above it
//! can be redone. Recording a new entry discards everything above the
//! cursor.
//!
//! ## Batches
//!
//! Records added while a batch is open are collected and committed as a
//! single [`Entry::Batch`] when the outermost batch closes. Nested batches
//! splice their records into the parent.
//!
//! ## Pausing
//!
//! While paused, [`HistoryManager::add_record`] drops records. Undo, redo
//! and remote application pause recording through a [`PauseGuard`], so a
//! plugin re-applying a record can call its usual recording code without
//! polluting the stack. The pause is depth-counted and always released on
//! drop, including on error paths.

use crate::config::HistoryConfig;
use crate::error::{HistoryError, HistoryResult};
use crate::plugin::{apply_in_direction, ApplyDirection, PluginRegistry};
use easel_protocol::{Entry, Record, Snapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Result of [`HistoryManager::add_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Recording is paused; the record was dropped.
    Dropped,
    /// The record joined the open batch.
    Batched,
    /// The record was pushed as a new entry.
    Recorded,
    /// The record failed validation and was dropped.
    Rejected,
}

/// Result of [`HistoryManager::end_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    /// An inner batch was merged into its parent.
    Merged,
    /// The outermost batch was empty; nothing was recorded.
    Empty,
    /// The outermost batch was pushed as one entry.
    Recorded,
    /// No batch was open.
    NotOpen,
}

/// Notifications emitted by the history manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    /// An undo is about to replay an entry.
    BeforeUndo,
    /// An undo finished.
    AfterUndo,
    /// A redo is about to replay an entry.
    BeforeRedo,
    /// A redo finished.
    AfterRedo,
    /// The stack or cursor changed.
    StackChanged {
        /// Whether an undo is possible now.
        can_undo: bool,
        /// Whether a redo is possible now.
        can_redo: bool,
    },
    /// The history was cleared.
    Cleared,
}

/// Handle returned by [`HistoryManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&HistoryEvent) + Send + Sync>;

/// Receives a request to drop the active selection before undo or redo.
pub trait SelectionSink: Send + Sync {
    /// Discards the active selection.
    fn discard_active_selection(&self);
}

/// Counters describing history activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryStats {
    /// Entries pushed onto the stack.
    pub entries_recorded: u64,
    /// Records dropped because recording was paused.
    pub records_dropped: u64,
    /// Records rejected by validation.
    pub records_rejected: u64,
    /// Entries evicted to respect the capacity.
    pub entries_evicted: u64,
    /// Successful undo steps.
    pub undos: u64,
    /// Successful redo steps.
    pub redos: u64,
    /// Undo or redo requests ignored while another was in progress.
    pub overlapping_requests: u64,
    /// Records skipped because their owner was not registered.
    pub missing_plugins: u64,
    /// Times the history was cleared.
    pub clears: u64,
}

#[derive(Default)]
struct HistoryState {
    stack: Vec<Arc<Entry>>,
    cursor: usize,
    batches: Vec<Vec<Record>>,
    outbound: VecDeque<Entry>,
}

impl HistoryState {
    fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    fn can_redo(&self) -> bool {
        self.cursor < self.stack.len()
    }
}

/// Bounded undo/redo history with batching and an outbound sync queue.
pub struct HistoryManager {
    config: HistoryConfig,
    registry: Arc<PluginRegistry>,
    state: Mutex<HistoryState>,
    pause_depth: AtomicUsize,
    replaying: AtomicBool,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    selection: RwLock<Option<Arc<dyn SelectionSink>>>,
    stats: Mutex<HistoryStats>,
}

impl HistoryManager {
    /// Creates a history manager with the default configuration.
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self::with_config(HistoryConfig::default(), registry)
    }

    /// Creates a history manager.
    pub fn with_config(config: HistoryConfig, registry: Arc<PluginRegistry>) -> Self {
        Self {
            config,
            registry,
            state: Mutex::new(HistoryState::default()),
            pause_depth: AtomicUsize::new(0),
            replaying: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            selection: RwLock::new(None),
            stats: Mutex::new(HistoryStats::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Returns the plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Returns a copy of the activity counters.
    pub fn stats(&self) -> HistoryStats {
        self.stats.lock().clone()
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Records a new change.
    ///
    /// Dropped while paused, collected while a batch is open, otherwise
    /// pushed as a single entry.
    pub fn add_record(&self, record: Record) -> AddOutcome {
        if self.is_paused() {
            trace!(record_id = %record.id, owner = %record.owner, "recording paused, record dropped");
            self.stats.lock().records_dropped += 1;
            return AddOutcome::Dropped;
        }

        if let Err(e) = record.validate() {
            warn!(record_id = %record.id, error = %e, "rejecting invalid record");
            self.stats.lock().records_rejected += 1;
            return AddOutcome::Rejected;
        }

        let changed = {
            let mut state = self.state.lock();
            if let Some(batch) = state.batches.last_mut() {
                batch.push(record);
                return AddOutcome::Batched;
            }
            self.push_entry(&mut state, Entry::Single(record))
        };
        self.emit(&changed);
        AddOutcome::Recorded
    }

    /// Records an object creation.
    pub fn record_add(&self, owner: &str, after: Vec<Snapshot>, need_sync: bool) -> AddOutcome {
        self.add_record(Record::add(owner, after).with_need_sync(need_sync))
    }

    /// Records an object removal.
    pub fn record_remove(&self, owner: &str, before: Vec<Snapshot>, need_sync: bool) -> AddOutcome {
        self.add_record(Record::remove(owner, before).with_need_sync(need_sync))
    }

    /// Records an object modification.
    pub fn record_modify(
        &self,
        owner: &str,
        before: Vec<Snapshot>,
        after: Vec<Snapshot>,
        need_sync: bool,
    ) -> HistoryResult<AddOutcome> {
        let record = Record::modify(owner, before, after)?;
        Ok(self.add_record(record.with_need_sync(need_sync)))
    }

    /// Pushes `entry`, truncating the redo tail and evicting the oldest
    /// entries beyond capacity. Returns the resulting stack notification.
    fn push_entry(&self, state: &mut HistoryState, entry: Entry) -> HistoryEvent {
        if entry.need_sync() {
            state.outbound.push_back(entry.clone());
        }

        let cursor = state.cursor;
        state.stack.truncate(cursor);
        state.stack.push(Arc::new(entry));
        state.cursor += 1;

        let mut evicted = 0;
        while state.stack.len() > self.config.max_entries {
            state.stack.remove(0);
            state.cursor -= 1;
            evicted += 1;
        }

        let mut stats = self.stats.lock();
        stats.entries_recorded += 1;
        stats.entries_evicted += evicted;
        if evicted > 0 {
            debug!(evicted, "history capacity reached, oldest entries evicted");
        }

        HistoryEvent::StackChanged {
            can_undo: state.can_undo(),
            can_redo: state.can_redo(),
        }
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Opens a batch. Batches nest.
    pub fn begin_batch(&self) -> usize {
        let mut state = self.state.lock();
        state.batches.push(Vec::new());
        state.batches.len()
    }

    /// Closes the innermost batch.
    pub fn end_batch(&self) -> BatchEnd {
        let changed = {
            let mut state = self.state.lock();
            let Some(records) = state.batches.pop() else {
                warn!("end_batch called without an open batch");
                return BatchEnd::NotOpen;
            };
            if let Some(parent) = state.batches.last_mut() {
                parent.extend(records);
                return BatchEnd::Merged;
            }
            if records.is_empty() {
                return BatchEnd::Empty;
            }
            self.push_entry(&mut state, Entry::Batch(records))
        };
        self.emit(&changed);
        BatchEnd::Recorded
    }

    /// Returns the number of open batches.
    pub fn batch_depth(&self) -> usize {
        self.state.lock().batches.len()
    }

    /// Opens a batch that closes when the guard is dropped.
    pub fn batch(&self) -> BatchGuard<'_> {
        self.begin_batch();
        BatchGuard { history: self }
    }

    /// Runs `f` inside a batch. The batch closes even if `f` panics.
    pub fn run_batch<T>(&self, f: impl FnOnce() -> T) -> T {
        let _batch = self.batch();
        f()
    }

    /// Awaits `fut` inside a batch. The batch closes when `fut` completes
    /// or is dropped.
    pub async fn run_batch_async<F: Future>(&self, fut: F) -> F::Output {
        let _batch = self.batch();
        fut.await
    }

    // ------------------------------------------------------------------
    // Pausing
    // ------------------------------------------------------------------

    /// Pauses recording until the returned guard is dropped.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.pause_depth.fetch_add(1, Ordering::SeqCst);
        PauseGuard {
            depth: &self.pause_depth,
        }
    }

    /// Returns true while recording is paused.
    pub fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::SeqCst) > 0
    }

    // ------------------------------------------------------------------
    // Undo / redo
    // ------------------------------------------------------------------

    /// Returns true if an entry can be undone.
    pub fn can_undo(&self) -> bool {
        self.state.lock().can_undo()
    }

    /// Returns true if an entry can be redone.
    pub fn can_redo(&self) -> bool {
        self.state.lock().can_redo()
    }

    /// Undoes the entry below the cursor.
    ///
    /// Returns `Ok(false)` if there is nothing to undo or another undo or
    /// redo is in progress. A batch is reverted last record first. If the
    /// entry needs sync, its reverse is queued for push.
    pub async fn perform_undo(&self) -> HistoryResult<bool> {
        self.perform(ApplyDirection::Undo).await
    }

    /// Redoes the entry at the cursor.
    ///
    /// Returns `Ok(false)` if there is nothing to redo or another undo or
    /// redo is in progress. A batch is re-applied in original order. If
    /// the entry needs sync, it is queued for push again.
    pub async fn perform_redo(&self) -> HistoryResult<bool> {
        self.perform(ApplyDirection::Redo).await
    }

    async fn perform(&self, direction: ApplyDirection) -> HistoryResult<bool> {
        let Some(_replay) = ReplayGuard::acquire(&self.replaying) else {
            debug!(?direction, "ignoring request while a replay is in progress");
            self.stats.lock().overlapping_requests += 1;
            return Ok(false);
        };

        let entry = {
            let mut state = self.state.lock();
            match direction {
                ApplyDirection::Undo => {
                    if !state.can_undo() {
                        return Ok(false);
                    }
                    state.cursor -= 1;
                    Arc::clone(&state.stack[state.cursor])
                }
                ApplyDirection::Redo => {
                    if !state.can_redo() {
                        return Ok(false);
                    }
                    let entry = Arc::clone(&state.stack[state.cursor]);
                    state.cursor += 1;
                    entry
                }
            }
        };

        let (before, after) = match direction {
            ApplyDirection::Undo => (HistoryEvent::BeforeUndo, HistoryEvent::AfterUndo),
            ApplyDirection::Redo => (HistoryEvent::BeforeRedo, HistoryEvent::AfterRedo),
        };

        self.emit(&before);
        let result = {
            let _pause = self.pause();
            self.discard_selection();
            self.replay(&entry, direction).await
        };
        self.emit(&after);
        self.emit(&self.stack_changed());

        result?;

        {
            let mut stats = self.stats.lock();
            match direction {
                ApplyDirection::Undo => stats.undos += 1,
                ApplyDirection::Redo => stats.redos += 1,
            }
        }

        if entry.need_sync() {
            let outbound = match direction {
                ApplyDirection::Undo => entry.reverse(),
                ApplyDirection::Redo => (*entry).clone(),
            };
            self.state.lock().outbound.push_back(outbound);
        }

        Ok(true)
    }

    async fn replay(&self, entry: &Entry, direction: ApplyDirection) -> HistoryResult<()> {
        let records = entry.records();
        match direction {
            ApplyDirection::Undo => {
                for record in records.iter().rev() {
                    self.apply_record(record, direction).await?;
                }
            }
            ApplyDirection::Redo => {
                for record in records {
                    self.apply_record(record, direction).await?;
                }
            }
        }
        Ok(())
    }

    /// Dispatches `record` to its owning plugin.
    ///
    /// A record whose owner is not registered is logged and skipped.
    /// Callers replaying remote or historical records should hold a
    /// [`PauseGuard`] around this call.
    pub async fn apply_record(&self, record: &Record, direction: ApplyDirection) -> HistoryResult<()> {
        let Some(applier) = self.registry.get(&record.owner) else {
            warn!(owner = %record.owner, record_id = %record.id, "no plugin registered for record owner, skipping");
            self.stats.lock().missing_plugins += 1;
            return Ok(());
        };

        apply_in_direction(applier.as_ref(), record, direction)
            .await
            .map_err(|source| HistoryError::Apply {
                owner: record.owner.clone(),
                record_id: record.id.to_string(),
                source,
            })
    }

    /// Sets the collaborator told to drop the selection before replay.
    pub fn set_selection_sink(&self, sink: Arc<dyn SelectionSink>) {
        *self.selection.write() = Some(sink);
    }

    fn discard_selection(&self) {
        let sink = self.selection.read().clone();
        if let Some(sink) = sink {
            sink.discard_active_selection();
        }
    }

    // ------------------------------------------------------------------
    // Inspection and reset
    // ------------------------------------------------------------------

    /// Returns the number of entries on the stack.
    pub fn len(&self) -> usize {
        self.state.lock().stack.len()
    }

    /// Returns true if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().stack.is_empty()
    }

    /// Returns the cursor position.
    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    /// Returns a copy of the stack, oldest first.
    pub fn entries(&self) -> Vec<Entry> {
        self.state.lock().stack.iter().map(|e| (**e).clone()).collect()
    }

    /// Empties the stack and resets the cursor.
    ///
    /// Open batches and queued outbound entries are kept.
    pub fn clear(&self) {
        let changed = {
            let mut state = self.state.lock();
            state.stack.clear();
            state.cursor = 0;
            self.stack_changed_locked(&state)
        };
        self.stats.lock().clears += 1;
        self.emit(&HistoryEvent::Cleared);
        self.emit(&changed);
    }

    /// Takes every entry queued for push, in production order.
    pub fn drain_outbound(&self) -> Vec<Entry> {
        self.state.lock().outbound.drain(..).collect()
    }

    /// Returns the number of entries queued for push.
    pub fn outbound_len(&self) -> usize {
        self.state.lock().outbound.len()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers a listener. Listeners run on the calling task, outside of
    /// internal locks.
    pub fn subscribe(&self, listener: impl Fn(&HistoryEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: &HistoryEvent) {
        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn stack_changed(&self) -> HistoryEvent {
        self.stack_changed_locked(&self.state.lock())
    }

    fn stack_changed_locked(&self, state: &HistoryState) -> HistoryEvent {
        HistoryEvent::StackChanged {
            can_undo: state.can_undo(),
            can_redo: state.can_redo(),
        }
    }
}

impl std::fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HistoryManager")
            .field("entries", &state.stack.len())
            .field("cursor", &state.cursor)
            .field("open_batches", &state.batches.len())
            .field("outbound", &state.outbound.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Keeps recording paused while alive.
#[must_use = "recording resumes as soon as the guard is dropped"]
pub struct PauseGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Closes a batch when dropped.
#[must_use = "the batch closes as soon as the guard is dropped"]
pub struct BatchGuard<'a> {
    history: &'a HistoryManager,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.history.end_batch();
    }
}

struct ReplayGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReplayGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostCall, MemoryObjectHost, MemoryPlugin};
    use crate::plugin::HostApplier;
    use serde_json::json;

    fn snap(id: &str, x: i64) -> Snapshot {
        Snapshot::new(id, json!({ "x": x }))
    }

    fn setup(max_entries: usize) -> (HistoryManager, Arc<MemoryPlugin>) {
        let registry = Arc::new(PluginRegistry::new());
        let plugin = Arc::new(HostApplier::new(MemoryObjectHost::new()));
        registry.register("image", plugin.clone());
        (
            HistoryManager::with_config(HistoryConfig::new(max_entries), registry),
            plugin,
        )
    }

    #[test]
    fn record_and_truncate_redo_tail() {
        let (history, _) = setup(10);
        history.record_add("image", vec![snap("a", 1)], false);
        history.record_add("image", vec![snap("b", 1)], false);
        assert_eq!(history.len(), 2);
        assert_eq!(history.cursor(), 2);

        {
            let mut state = history.state.lock();
            state.cursor = 1;
        }
        assert!(history.can_redo());

        history.record_add("image", vec![snap("c", 1)], false);
        assert_eq!(history.len(), 2);
        assert!(!history.can_redo());
        assert_eq!(history.entries()[1].records()[0].object_ids, vec!["c".to_string()]);
    }

    #[test]
    fn eviction_drops_oldest() {
        let (history, _) = setup(3);
        for i in 0..5 {
            history.record_add("image", vec![snap(&format!("o{}", i), 0)], false);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.cursor(), 3);
        assert_eq!(history.entries()[0].records()[0].object_ids, vec!["o2".to_string()]);
        assert_eq!(history.stats().entries_evicted, 2);
    }

    #[test]
    fn paused_records_are_dropped() {
        let (history, _) = setup(10);
        {
            let _outer = history.pause();
            let _inner = history.pause();
            assert_eq!(history.record_add("image", vec![snap("a", 1)], false), AddOutcome::Dropped);
        }
        assert!(!history.is_paused());
        assert_eq!(history.record_add("image", vec![snap("a", 1)], false), AddOutcome::Recorded);
        assert_eq!(history.stats().records_dropped, 1);
    }

    #[test]
    fn invalid_records_are_rejected() {
        let (history, _) = setup(10);
        let mut record = Record::add("image", vec![snap("a", 1)]);
        record.owner.clear();
        assert_eq!(history.add_record(record), AddOutcome::Rejected);
        assert!(history.is_empty());
    }

    #[test]
    fn nested_batches_collapse() {
        let (history, _) = setup(10);
        history.begin_batch();
        history.record_add("image", vec![snap("a", 1)], false);
        history.begin_batch();
        history.record_add("image", vec![snap("b", 1)], false);
        assert_eq!(history.end_batch(), BatchEnd::Merged);
        history.record_add("image", vec![snap("c", 1)], false);
        assert_eq!(history.end_batch(), BatchEnd::Recorded);

        assert_eq!(history.len(), 1);
        let entry = &history.entries()[0];
        assert!(entry.is_batch());
        let ids: Vec<_> = entry.records().iter().map(|r| r.object_ids[0].clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_batch_records_nothing() {
        let (history, _) = setup(10);
        history.begin_batch();
        assert_eq!(history.end_batch(), BatchEnd::Empty);
        assert_eq!(history.end_batch(), BatchEnd::NotOpen);
        assert!(history.is_empty());
    }

    #[test]
    fn run_batch_closes_on_panic() {
        let (history, _) = setup(10);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            history.run_batch(|| {
                history.record_add("image", vec![snap("a", 1)], false);
                panic!("plugin failure");
            })
        }));
        assert!(result.is_err());
        assert_eq!(history.batch_depth(), 0);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn undo_redo_single_add() {
        let (history, plugin) = setup(10);
        plugin.host().insert(snap("a", 1));
        history.record_add("image", vec![snap("a", 1)], false);

        assert!(history.perform_undo().await.unwrap());
        assert!(plugin.host().get("a").is_none());
        assert_eq!(plugin.host().calls(), vec![HostCall::Destroy("a".into())]);
        assert!(!history.can_undo());
        assert!(history.can_redo());

        plugin.host().clear_calls();
        assert!(history.perform_redo().await.unwrap());
        assert_eq!(plugin.host().get("a"), Some(snap("a", 1)));
        assert_eq!(plugin.host().calls(), vec![HostCall::Create("a".into())]);
        assert!(!history.perform_redo().await.unwrap());
    }

    #[tokio::test]
    async fn undo_after_eviction_stops_at_capacity() {
        let (history, plugin) = setup(3);
        for i in 0..5 {
            let snapshot = snap(&format!("o{}", i), 0);
            plugin.host().insert(snapshot.clone());
            history.record_add("image", vec![snapshot], false);
        }

        for _ in 0..3 {
            assert!(history.perform_undo().await.unwrap());
        }
        assert!(!history.can_undo());
        assert!(!history.perform_undo().await.unwrap());
        assert_eq!(
            plugin.host().calls(),
            vec![
                HostCall::Destroy("o4".into()),
                HostCall::Destroy("o3".into()),
                HostCall::Destroy("o2".into()),
            ]
        );
        assert_eq!(plugin.host().ids(), vec!["o0", "o1"]);
    }

    #[tokio::test]
    async fn batch_notifies_once_per_step() {
        let (history, plugin) = setup(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        history.subscribe(move |event| sink.lock().push(*event));
        let stack_changes = |events: &[HistoryEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, HistoryEvent::StackChanged { .. }))
                .count()
        };

        history.begin_batch();
        for id in ["a", "b", "c"] {
            plugin.host().insert(snap(id, 1));
            history.record_add("image", vec![snap(id, 1)], false);
        }
        assert!(seen.lock().is_empty());
        assert_eq!(history.end_batch(), BatchEnd::Recorded);
        assert_eq!(
            *seen.lock(),
            vec![HistoryEvent::StackChanged { can_undo: true, can_redo: false }]
        );

        seen.lock().clear();
        history.perform_undo().await.unwrap();
        assert_eq!(stack_changes(&seen.lock()), 1);
        assert!(plugin.host().is_empty());

        seen.lock().clear();
        history.perform_redo().await.unwrap();
        assert_eq!(stack_changes(&seen.lock()), 1);
        assert_eq!(plugin.host().len(), 3);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn batch_undo_runs_in_reverse() {
        let (history, plugin) = setup(10);
        history.run_batch(|| {
            history.record_add("image", vec![snap("a", 1)], false);
            history.record_add("image", vec![snap("b", 1)], false);
        });
        plugin.host().insert(snap("a", 1));
        plugin.host().insert(snap("b", 1));

        history.perform_undo().await.unwrap();
        assert_eq!(
            plugin.host().calls(),
            vec![HostCall::Destroy("b".into()), HostCall::Destroy("a".into())]
        );

        plugin.host().clear_calls();
        history.perform_redo().await.unwrap();
        assert_eq!(
            plugin.host().calls(),
            vec![HostCall::Create("a".into()), HostCall::Create("b".into())]
        );
    }

    #[tokio::test]
    async fn replay_does_not_record() {
        let (history, plugin) = setup(10);
        plugin.host().insert(snap("a", 1));
        history.record_remove("image", vec![snap("a", 1)], false);

        history.perform_undo().await.unwrap();
        // A plugin recording during replay is ignored.
        assert_eq!(history.len(), 1);
        assert!(!history.is_paused());
    }

    #[tokio::test]
    async fn failed_replay_resumes_recording() {
        let (history, plugin) = setup(10);
        history.record_add("image", vec![snap("a", 1)], false);
        plugin.host().fail_on("a");

        let err = history.perform_undo().await.unwrap_err();
        assert!(matches!(err, HistoryError::Apply { ref owner, .. } if owner == "image"));
        assert!(!history.is_paused());
        assert_eq!(history.record_add("image", vec![snap("b", 1)], false), AddOutcome::Recorded);
    }

    #[tokio::test]
    async fn missing_plugin_is_skipped() {
        let (history, _) = setup(10);
        history.record_add("ghost", vec![snap("a", 1)], false);
        assert!(history.perform_undo().await.unwrap());
        assert_eq!(history.stats().missing_plugins, 1);
    }

    #[tokio::test]
    async fn need_sync_entries_are_queued() {
        let (history, plugin) = setup(10);
        history.record_add("image", vec![snap("a", 1)], true);
        history.record_add("image", vec![snap("b", 1)], false);
        assert_eq!(history.outbound_len(), 1);

        plugin.host().insert(snap("b", 1));
        history.perform_undo().await.unwrap();
        assert_eq!(history.outbound_len(), 1);

        plugin.host().insert(snap("a", 1));
        history.perform_undo().await.unwrap();
        let queued = history.drain_outbound();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[1].records()[0].kind, easel_protocol::RecordKind::Remove);
        assert_eq!(history.outbound_len(), 0);
    }

    #[tokio::test]
    async fn listeners_observe_events() {
        let (history, plugin) = setup(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = history.subscribe(move |event| sink.lock().push(*event));

        history.record_add("image", vec![snap("a", 1)], false);
        plugin.host().insert(snap("a", 1));
        history.perform_undo().await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                HistoryEvent::StackChanged { can_undo: true, can_redo: false },
                HistoryEvent::BeforeUndo,
                HistoryEvent::AfterUndo,
                HistoryEvent::StackChanged { can_undo: false, can_redo: true },
            ]
        );

        assert!(history.unsubscribe(id));
        history.clear();
        assert_eq!(seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn selection_is_discarded_before_replay() {
        struct CountingSink(AtomicUsize);
        impl SelectionSink for CountingSink {
            fn discard_active_selection(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (history, _) = setup(10);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        history.set_selection_sink(sink.clone());
        history.record_add("image", vec![snap("a", 1)], false);

        history.perform_undo().await.unwrap();
        history.perform_redo().await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_keeps_outbound_queue() {
        let (history, _) = setup(10);
        history.record_add("image", vec![snap("a", 1)], true);
        history.clear();
        assert!(history.is_empty());
        assert!(!history.can_undo());
        assert_eq!(history.outbound_len(), 1);
    }
}
