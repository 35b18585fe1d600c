//! Sync session state machine.
//!
//! A [`SyncSession`] connects one client's [`HistoryManager`] to the
//! server:
//!
//! - local entries that need sync are pushed as `client:change` events
//! - incoming events from other clients are deduplicated by sequence
//!   number and replayed through the owning plugin
//! - the session can rebuild the whole document from the server's full
//!   state and upload a full document when asked to
//!
//! Every event carries a global sequence number. The session keeps the
//! highest number it has seen; anything at or below it is ignored, and a
//! jump of more than one marks the session as needing a resync.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{ApplyResult, SyncError, SyncResult};
use crate::history::HistoryManager;
use crate::plugin::ApplyDirection;
use crate::transport::{LiveChannel, SyncTransport};
use async_trait::async_trait;
use easel_protocol::{
    AddImageData, Entry, EventData, EventPayload, FullSyncRequest, ObjectPayload, OutboundEvent,
    PushEventRequest, Record, SequencedEvent, ServerMessage,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// The lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet initialized.
    Idle,
    /// Fetching the initial state.
    Initializing,
    /// Receiving and pushing events.
    Live,
    /// Destroyed; no further I/O.
    Closed,
}

impl SessionState {
    /// Returns true if the session may perform I/O.
    pub fn is_open(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

/// What happened to an incoming event or frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event was applied locally.
    Applied,
    /// The event was produced by this client.
    Echo,
    /// The event's sequence number was already seen.
    Stale,
    /// The event could not be decoded and was dropped.
    Malformed,
    /// The event was valid but nothing could handle it.
    Skipped,
    /// A control frame, such as the connection acknowledgement.
    Control,
}

/// Statistics about sync activity.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Events pushed successfully.
    pub events_pushed: u64,
    /// Push requests that failed.
    pub pushes_failed: u64,
    /// Remote events applied.
    pub events_applied: u64,
    /// Own events ignored on the push channel.
    pub echoes_ignored: u64,
    /// Events ignored because their sequence was already seen.
    pub stale_ignored: u64,
    /// Frames or events dropped as malformed.
    pub malformed_dropped: u64,
    /// Sequence gaps detected.
    pub gaps_detected: u64,
    /// Remote events that consumed a sequence number but failed to apply.
    pub apply_failures: u64,
    /// Full resyncs performed, including initialization.
    pub full_resyncs: u64,
    /// Full uploads performed.
    pub full_uploads: u64,
    /// Last successful push.
    pub last_push_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of [`SyncSession::flush_outbound`].
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Entries pushed successfully.
    pub pushed: usize,
    /// Failures, one per entry that could not be pushed.
    pub failed: Vec<SyncError>,
}

impl FlushReport {
    /// Returns true if every entry was pushed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Handles `server:add_image` events.
#[async_trait]
pub trait InjectionHandler: Send + Sync {
    /// Adds images for the given URLs to the document.
    async fn add_images(&self, urls: &[String]) -> ApplyResult<()>;
}

/// The sync session manages one client's connection to the server.
pub struct SyncSession<T: SyncTransport> {
    config: SyncConfig,
    client_id: String,
    transport: Arc<T>,
    history: Arc<HistoryManager>,
    local_sequence: AtomicU64,
    state: RwLock<SessionState>,
    stats: RwLock<SyncStats>,
    needs_resync: AtomicBool,
    needs_full_upload: AtomicBool,
    injection: RwLock<Option<Arc<dyn InjectionHandler>>>,
}

impl<T: SyncTransport> SyncSession<T> {
    /// Creates a new session.
    ///
    /// The client ID comes from the configuration or is generated.
    pub fn new(config: SyncConfig, transport: T, history: Arc<HistoryManager>) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            config,
            client_id,
            transport: Arc::new(transport),
            history,
            local_sequence: AtomicU64::new(0),
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(SyncStats::default()),
            needs_resync: AtomicBool::new(false),
            needs_full_upload: AtomicBool::new(false),
            injection: RwLock::new(None),
        }
    }

    /// Returns this client's ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the history manager.
    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    /// Gets the current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the highest sequence number seen.
    pub fn local_sequence_id(&self) -> u64 {
        self.local_sequence.load(Ordering::SeqCst)
    }

    /// Returns true if a sequence gap was detected since the last resync.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    /// Returns true if the server queue grew past the upload threshold.
    pub fn needs_full_upload(&self) -> bool {
        self.needs_full_upload.load(Ordering::SeqCst)
    }

    /// Sets the handler for `server:add_image` events.
    pub fn set_injection_handler(&self, handler: Arc<dyn InjectionHandler>) {
        *self.injection.write() = Some(handler);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(SyncError::Closed)
        }
    }

    fn record_error(&self, error: &SyncError) {
        self.stats.write().last_error = Some(error.to_string());
    }

    fn flag_gap(&self, known: u64, incoming: u64) {
        warn!(known, incoming, "sequence gap detected, resync required");
        self.stats.write().gaps_detected += 1;
        self.needs_resync.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Opens the push channel and loads the authoritative document.
    ///
    /// The channel is opened first so that events broadcast while the
    /// full state is fetched are buffered; those already covered by the
    /// full state are dropped as stale when the channel is read.
    pub async fn initialize(&self) -> SyncResult<LiveChannel> {
        let current = self.state();
        if current != SessionState::Idle {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", current),
                to: "Initializing".into(),
            });
        }
        self.set_state(SessionState::Initializing);

        let result = async {
            let channel = self.transport.subscribe(&self.client_id).await?;
            self.full_resync().await?;
            Ok::<_, SyncError>(channel)
        }
        .await;

        match result {
            Ok(channel) => {
                self.set_state(SessionState::Live);
                info!(
                    client_id = %self.client_id,
                    sequence_id = self.local_sequence_id(),
                    "sync session live"
                );
                Ok(channel)
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "sync session initialization failed");
                self.record_error(&e);
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Rebuilds the document from the server's full state.
    pub async fn resync(&self) -> SyncResult<()> {
        self.ensure_open()?;
        info!(client_id = %self.client_id, "full resync");
        self.full_resync().await.inspect_err(|e| self.record_error(e))
    }

    /// Marks the session closed and closes the transport.
    ///
    /// Further operations fail with [`SyncError::Closed`]. Calling this
    /// twice is harmless.
    pub async fn destroy(&self) -> SyncResult<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        self.set_state(SessionState::Closed);
        info!(client_id = %self.client_id, "sync session closed");
        self.transport.close().await
    }

    async fn full_resync(&self) -> SyncResult<()> {
        let full = self.transport.fetch_full_state().await?;
        let trailing = full.sorted_trailing_events();

        self.replace_document(full.document.as_deref().unwrap_or_default()).await?;

        // Trailing events are replayed against the uploaded document,
        // including this client's own events.
        let baseline = trailing
            .first()
            .map(|e| e.sequence_id.saturating_sub(1))
            .unwrap_or(full.sequence_id);
        self.local_sequence.store(baseline, Ordering::SeqCst);
        self.needs_resync.store(false, Ordering::SeqCst);

        for event in &trailing {
            if let Err(e) = self.apply_event(event, false).await {
                warn!(sequence_id = event.sequence_id, error = %e, "failed to apply trailing event");
            }
        }

        self.local_sequence.fetch_max(full.sequence_id, Ordering::SeqCst);
        self.history.clear();

        let mut stats = self.stats.write();
        stats.full_resyncs += 1;
        debug!(
            objects = full.document.as_ref().map(Vec::len).unwrap_or(0),
            trailing = trailing.len(),
            sequence_id = full.sequence_id,
            "document rebuilt from full state"
        );
        Ok(())
    }

    /// Clears every plugin and recreates `objects` with recording paused.
    async fn replace_document(&self, objects: &[ObjectPayload]) -> SyncResult<()> {
        let registry = Arc::clone(self.history.registry());
        {
            let _pause = self.history.pause();
            for (name, applier) in registry.entries() {
                applier.clear_objects().await.inspect_err(|e| {
                    warn!(plugin = %name, error = %e, "failed to clear plugin objects");
                })?;
            }

            for object in objects {
                let owner = match object.require_category() {
                    Ok(owner) => owner,
                    Err(e) => {
                        warn!(object_id = %object.id, error = %e, "dropping document object");
                        continue;
                    }
                };
                let record = Record::add(owner, vec![object.to_snapshot()]);
                self.history.apply_record(&record, ApplyDirection::Redo).await?;
            }
        }
        self.history.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Pushes one entry as `client:change` events.
    ///
    /// Returns the sequence number assigned to the last event. A failure
    /// leaves the local document untouched.
    pub async fn push_entry(&self, entry: &Entry) -> SyncResult<u64> {
        self.ensure_open()?;

        let events = OutboundEvent::from_entry(entry, &self.client_id)?;
        if events.is_empty() {
            return Ok(self.local_sequence_id());
        }
        let count = events.len() as u64;

        let response = match self.transport.push_events(&PushEventRequest::new(events)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "push failed, local edit kept");
                {
                    let mut stats = self.stats.write();
                    stats.pushes_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                return Err(e);
            }
        };

        let first = response.sequence_id.saturating_sub(count - 1);
        let previous = self.local_sequence.fetch_max(response.sequence_id, Ordering::SeqCst);
        if first > previous + 1 {
            self.flag_gap(previous, first);
        }

        if let Some(threshold) = self.config.full_upload_threshold {
            if response.queue_length > threshold {
                debug!(queue_length = response.queue_length, threshold, "full upload requested");
                self.needs_full_upload.store(true, Ordering::SeqCst);
            }
        }

        {
            let mut stats = self.stats.write();
            stats.events_pushed += count;
            stats.last_push_time = Some(Instant::now());
        }
        trace!(sequence_id = response.sequence_id, events = count, "entry pushed");
        Ok(response.sequence_id)
    }

    /// Pushes one entry, retrying retryable failures with backoff.
    pub async fn push_entry_with_retry(&self, entry: &Entry, retry: &RetryConfig) -> SyncResult<u64> {
        let mut attempt = 0;
        loop {
            let delay = retry.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.push_entry(entry).await {
                Ok(sequence_id) => return Ok(sequence_id),
                Err(e) if e.is_retryable() && retry.allows_retry(attempt) => {
                    debug!(attempt, error = %e, "retrying push");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pushes every entry queued by the history manager, in order.
    ///
    /// Entries that fail are reported and not retried.
    pub async fn flush_outbound(&self) -> SyncResult<FlushReport> {
        self.ensure_open()?;

        let mut report = FlushReport::default();
        for entry in self.history.drain_outbound() {
            match self.push_entry_with_retry(&entry, &self.config.retry).await {
                Ok(_) => report.pushed += 1,
                Err(e) => report.failed.push(e),
            }
        }
        Ok(report)
    }

    /// Uploads every plugin's objects as the new authoritative document.
    ///
    /// Returns the sequence number the document corresponds to.
    pub async fn upload_full_state(&self) -> SyncResult<u64> {
        self.ensure_open()?;

        let mut document = Vec::new();
        for (name, applier) in self.history.registry().entries() {
            document.extend(
                applier
                    .snapshot_objects()
                    .iter()
                    .map(|snapshot| ObjectPayload::from_snapshot(&name, snapshot)),
            );
        }

        let request = FullSyncRequest {
            client_id: self.client_id.clone(),
            base_sequence_id: Some(self.local_sequence_id()),
            document,
        };
        let response = self
            .transport
            .upload_full_state(&request)
            .await
            .inspect_err(|e| self.record_error(e))?;

        if !response.success {
            let err = SyncError::ServerError(format!(
                "full upload rejected at sequence {}",
                response.sequence_id
            ));
            self.record_error(&err);
            return Err(err);
        }

        self.needs_full_upload.store(false, Ordering::SeqCst);
        self.local_sequence.fetch_max(response.sequence_id, Ordering::SeqCst);
        self.stats.write().full_uploads += 1;
        info!(
            objects = request.document.len(),
            sequence_id = response.sequence_id,
            "full document uploaded"
        );
        Ok(response.sequence_id)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handles one raw frame from the push channel.
    pub async fn handle_frame(&self, frame: &str) -> SyncResult<EventOutcome> {
        match ServerMessage::from_frame(frame) {
            Ok(ServerMessage::Connected { client_id }) => {
                debug!(client_id = ?client_id, "push channel connected");
                Ok(EventOutcome::Control)
            }
            Ok(ServerMessage::SyncEvent { data }) => self.handle_event(&data).await,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                self.stats.write().malformed_dropped += 1;
                Ok(EventOutcome::Malformed)
            }
        }
    }

    /// Handles one sequenced event from another client or the server.
    ///
    /// Own events are ignored, as are events at or below the local
    /// sequence number. Applying an event clears the local history.
    pub async fn handle_event(&self, event: &SequencedEvent) -> SyncResult<EventOutcome> {
        self.ensure_open()?;
        self.apply_event(event, true).await
    }

    /// Handles every frame already buffered on `channel` without waiting.
    ///
    /// Returns the number of frames handled. Failures are logged.
    pub async fn drain_channel(&self, channel: &mut LiveChannel) -> usize {
        let mut handled = 0;
        while let Some(frame) = channel.try_recv() {
            if let Err(e) = self.handle_frame(&frame).await {
                warn!(error = %e, "failed to handle frame");
            }
            handled += 1;
        }
        handled
    }

    /// Handles frames until the channel ends or the session is destroyed.
    pub async fn run(&self, mut channel: LiveChannel) -> SyncResult<()> {
        while let Some(frame) = channel.recv().await {
            if self.state() == SessionState::Closed {
                break;
            }
            if let Err(e) = self.handle_frame(&frame).await {
                warn!(error = %e, "failed to handle frame");
                self.record_error(&e);
            }
        }
        debug!(client_id = %self.client_id, "push channel closed");
        Ok(())
    }

    async fn apply_event(&self, event: &SequencedEvent, suppress_echo: bool) -> SyncResult<EventOutcome> {
        let payload = match event.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(sequence_id = event.sequence_id, error = %e, "dropping malformed event");
                self.stats.write().malformed_dropped += 1;
                return Ok(EventOutcome::Malformed);
            }
        };

        if suppress_echo && payload.client_id() == Some(self.client_id.as_str()) {
            trace!(sequence_id = event.sequence_id, "ignoring own event");
            self.stats.write().echoes_ignored += 1;
            return Ok(EventOutcome::Echo);
        }

        let known = self.local_sequence_id();
        if event.sequence_id <= known {
            trace!(sequence_id = event.sequence_id, known, "ignoring stale event");
            self.stats.write().stale_ignored += 1;
            return Ok(EventOutcome::Stale);
        }
        if event.sequence_id > known + 1 {
            self.flag_gap(known, event.sequence_id);
        }
        self.local_sequence.fetch_max(event.sequence_id, Ordering::SeqCst);

        let outcome = match payload {
            EventPayload::ClientChange(data) => self.apply_change(&data).await,
            EventPayload::AddImage(data) => self.apply_injection(&data).await,
        };
        self.history.clear();

        match &outcome {
            Ok(EventOutcome::Applied) => self.stats.write().events_applied += 1,
            Ok(_) => {}
            Err(e) => {
                // The sequence is consumed, so a redelivery would be stale.
                warn!(sequence_id = event.sequence_id, error = %e, "remote event failed, resync required");
                self.stats.write().apply_failures += 1;
                self.needs_resync.store(true, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn apply_change(&self, data: &EventData) -> SyncResult<EventOutcome> {
        let object = data.object();
        let owner = object.require_category()?;

        let current = if data.is_delete {
            None
        } else {
            self.history.registry().get(owner).and_then(|applier| {
                if !applier.contains_object(&data.id) {
                    return None;
                }
                Some(
                    applier
                        .snapshot_object(&data.id)
                        .unwrap_or_else(|| object.to_snapshot()),
                )
            })
        };
        let record = data.to_record(current)?;

        trace!(object_id = %data.id, kind = ?record.kind, owner, "applying remote change");
        let _pause = self.history.pause();
        self.history.apply_record(&record, ApplyDirection::Redo).await?;
        Ok(EventOutcome::Applied)
    }

    async fn apply_injection(&self, data: &AddImageData) -> SyncResult<EventOutcome> {
        let handler = self.injection.read().clone();
        let Some(handler) = handler else {
            warn!(urls = data.urls.len(), "no injection handler registered, skipping add_image event");
            return Ok(EventOutcome::Skipped);
        };

        let _pause = self.history.pause();
        handler.add_images(&data.urls).await?;
        Ok(EventOutcome::Applied)
    }
}
