//! Request handlers for sync endpoints.

use crate::channels::ClientChannels;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::event_log::EventLog;
use easel_protocol::endpoint::{
    DEBUG_PATH, EVENT_PATH, FULL_DATA_PATH, FULL_UPLOAD_PATH, INJECT_IMAGE_PATH, RESET_PATH,
};
use easel_protocol::{
    now_millis, AddImageData, FullState, FullSyncRequest, FullSyncResponse, OutboundEvent,
    PushEventRequest, PushEventResponse, SequencedEvent, ServerMessage,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Context for request handling.
pub struct HandlerContext {
    /// Hub configuration.
    pub config: HubConfig,
    /// Event log (shared across all handlers).
    pub log: Arc<EventLog>,
    /// Client push channels.
    pub channels: Arc<ClientChannels>,
    /// Serializes sequencing and broadcast so frames go out in order.
    publish: Mutex<()>,
    next_injection: AtomicU64,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: HubConfig, log: Arc<EventLog>, channels: Arc<ClientChannels>) -> Self {
        Self {
            config,
            log,
            channels,
            publish: Mutex::new(()),
            next_injection: AtomicU64::new(1),
        }
    }
}

/// Debug snapshot of the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStatus {
    /// Last assigned sequence number.
    pub sequence_id: u64,
    /// Events logged since the last upload.
    pub queue_length: usize,
    /// Whether a document was uploaded.
    pub has_document: bool,
    /// Objects in the uploaded document.
    pub document_objects: usize,
    /// Connected client IDs.
    pub connected_clients: Vec<String>,
    /// Most recent events.
    pub recent_events: Vec<SequencedEvent>,
}

#[derive(Serialize)]
struct Ack {
    success: bool,
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Returns the full state.
    pub fn handle_full_state(&self) -> FullState {
        self.context.log.full_state()
    }

    /// Handles a push request.
    ///
    /// Every event gets its own sequence number and is broadcast to every
    /// client, including the sender. The response carries the last number.
    pub fn handle_push(&self, request: PushEventRequest) -> HubResult<PushEventResponse> {
        if request.events.is_empty() {
            return Err(HubError::InvalidRequest("no events".into()));
        }
        if request.events.len() > self.context.config.max_push_batch {
            return Err(HubError::InvalidRequest(format!(
                "too many events: {} > {}",
                request.events.len(),
                self.context.config.max_push_batch
            )));
        }
        for event in &request.events {
            event
                .decode()
                .map_err(|e| HubError::InvalidRequest(format!("event {}: {}", event.id, e)))?;
        }

        self.publish(request.events)
    }

    /// Handles a full document upload.
    ///
    /// An upload based on an outdated sequence is answered with
    /// `success: false` and the current sequence.
    pub fn handle_upload(&self, request: FullSyncRequest) -> HubResult<FullSyncResponse> {
        if request.document.len() > self.context.config.max_document_objects {
            return Err(HubError::InvalidRequest(format!(
                "document too large: {} > {} objects",
                request.document.len(),
                self.context.config.max_document_objects
            )));
        }
        for object in &request.document {
            object
                .require_category()
                .map_err(|e| HubError::InvalidRequest(e.to_string()))?;
        }

        let objects = request.document.len();
        match self
            .context
            .log
            .replace_document(request.document, request.base_sequence_id)
        {
            Ok(sequence_id) => {
                info!(client_id = %request.client_id, objects, sequence_id, "full document stored");
                Ok(FullSyncResponse {
                    success: true,
                    sequence_id,
                })
            }
            Err(HubError::StaleUpload { base, current }) => {
                debug!(client_id = %request.client_id, base, current, "stale upload refused");
                Ok(FullSyncResponse {
                    success: false,
                    sequence_id: current,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcasts a `server:add_image` event.
    pub fn handle_inject(&self, data: AddImageData) -> HubResult<PushEventResponse> {
        if data.urls.is_empty() {
            return Err(HubError::InvalidRequest("no urls".into()));
        }
        let n = self.context.next_injection.fetch_add(1, Ordering::Relaxed);
        let event = OutboundEvent::add_image(format!("inject-{}-{}", now_millis(), n), data.urls)?;
        self.publish(vec![event])
    }

    /// Drops the log and the document. Connected clients stay subscribed.
    pub fn handle_reset(&self) {
        let _order = self.context.publish.lock();
        self.context.log.reset();
        info!(clients = self.context.channels.len(), "hub reset");
    }

    /// Returns the debug status.
    pub fn handle_status(&self) -> HubStatus {
        let log = &self.context.log;
        HubStatus {
            sequence_id: log.sequence_id(),
            queue_length: log.len(),
            has_document: log.has_document(),
            document_objects: log.document_len(),
            connected_clients: self.context.channels.client_ids(),
            recent_events: log.recent(self.context.config.status_recent_events),
        }
    }

    /// Routes a GET request by path.
    pub fn dispatch_get(&self, path: &str) -> HubResult<Vec<u8>> {
        match path {
            FULL_DATA_PATH => encode(&self.handle_full_state()),
            DEBUG_PATH => encode(&self.handle_status()),
            other => Err(HubError::NotFound(other.to_string())),
        }
    }

    /// Routes a POST request by path.
    pub fn dispatch_post(&self, path: &str, body: &[u8]) -> HubResult<Vec<u8>> {
        match path {
            EVENT_PATH => encode(&self.handle_push(decode(body)?)?),
            FULL_UPLOAD_PATH => encode(&self.handle_upload(decode(body)?)?),
            INJECT_IMAGE_PATH => encode(&self.handle_inject(decode(body)?)?),
            RESET_PATH => {
                self.handle_reset();
                encode(&Ack { success: true })
            }
            other => Err(HubError::NotFound(other.to_string())),
        }
    }

    fn publish(&self, events: Vec<OutboundEvent>) -> HubResult<PushEventResponse> {
        let _order = self.context.publish.lock();

        let sequenced = self.context.log.append(events);
        let mut delivered = 0;
        for event in &sequenced {
            let frame = ServerMessage::SyncEvent { data: event.clone() }.to_frame()?;
            delivered += self.context.channels.broadcast(&frame);
        }

        let sequence_id = sequenced.last().map(|e| e.sequence_id).unwrap_or(0);
        let queue_length = self.context.log.len();
        debug!(
            events = sequenced.len(),
            sequence_id, queue_length, delivered, "events sequenced and broadcast"
        );
        Ok(PushEventResponse {
            sequence_id,
            queue_length,
        })
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> HubResult<T> {
    serde_json::from_slice(body).map_err(|e| HubError::InvalidRequest(format!("bad body: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> HubResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| HubError::Internal(format!("failed to encode response: {}", e)))
}
