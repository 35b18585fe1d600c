//! Main sync hub.

use crate::channels::ClientChannels;
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::event_log::EventLog;
use crate::handler::{HandlerContext, HubStatus, RequestHandler};
use easel_protocol::{
    AddImageData, FullState, FullSyncRequest, FullSyncResponse, PushEventRequest,
    PushEventResponse,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The sync hub.
///
/// Holds the global event log and the push channels of every connected
/// client. Every accepted event is sequenced and broadcast to all
/// subscribers, the sender included.
///
/// # Example
///
/// ```
/// use easel_server::{HubConfig, SyncHub};
///
/// let hub = SyncHub::new(HubConfig::default());
/// let mut frames = hub.subscribe("client-1").unwrap();
/// assert!(frames.try_recv().unwrap().contains("connected"));
/// assert_eq!(hub.sequence_id(), 0);
/// ```
pub struct SyncHub {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncHub {
    /// Creates a new hub.
    pub fn new(config: HubConfig) -> Self {
        Self::with_log(config, Arc::new(EventLog::new()))
    }

    /// Creates a hub over an existing event log.
    pub fn with_log(config: HubConfig, log: Arc<EventLog>) -> Self {
        let context = Arc::new(HandlerContext::new(
            config,
            log,
            Arc::new(ClientChannels::new()),
        ));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Sequences and broadcasts pushed events.
    pub fn push_events(&self, request: PushEventRequest) -> HubResult<PushEventResponse> {
        self.handler.handle_push(request)
    }

    /// Returns the document and the events after it.
    pub fn full_state(&self) -> FullState {
        self.handler.handle_full_state()
    }

    /// Replaces the stored document.
    pub fn upload_full(&self, request: FullSyncRequest) -> HubResult<FullSyncResponse> {
        self.handler.handle_upload(request)
    }

    /// Broadcasts an image injection.
    pub fn inject_images(&self, urls: Vec<String>) -> HubResult<PushEventResponse> {
        self.handler.handle_inject(AddImageData { urls })
    }

    /// Opens the push channel for a client.
    pub fn subscribe(&self, client_id: &str) -> HubResult<mpsc::UnboundedReceiver<String>> {
        self.context.channels.subscribe(client_id)
    }

    /// Drops the push channel of a client.
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        self.context.channels.unsubscribe(client_id)
    }

    /// Clears the log and the document.
    pub fn reset(&self) {
        self.handler.handle_reset()
    }

    /// Returns the debug status.
    pub fn status(&self) -> HubStatus {
        self.handler.handle_status()
    }

    /// Routes a GET request by endpoint path.
    pub fn handle_get(&self, path: &str) -> HubResult<Vec<u8>> {
        self.handler.dispatch_get(path)
    }

    /// Routes a POST request by endpoint path.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> HubResult<Vec<u8>> {
        self.handler.dispatch_post(path, body)
    }

    /// Returns the last assigned sequence number.
    pub fn sequence_id(&self) -> u64 {
        self.context.log.sequence_id()
    }

    /// Returns the number of logged events.
    pub fn event_count(&self) -> usize {
        self.context.log.len()
    }

    /// Returns the number of subscribed clients.
    pub fn client_count(&self) -> usize {
        self.context.channels.len()
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_protocol::{EventData, EventPayload, ObjectPayload, OutboundEvent, ServerMessage};
    use serde_json::json;

    fn change(id: &str, client_id: &str) -> OutboundEvent {
        let object = ObjectPayload {
            id: id.into(),
            metadata: json!({ "category": "text" }),
            style: json!({}),
        };
        OutboundEvent::client_change(format!("r-{}", id), &EventData::new(object, client_id, false)).unwrap()
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> EventPayload {
        match ServerMessage::from_frame(&rx.try_recv().unwrap()).unwrap() {
            ServerMessage::SyncEvent { data } => data.decode().unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn hub_lifecycle() {
        let hub = SyncHub::default();
        assert_eq!(hub.sequence_id(), 0);
        assert_eq!(hub.event_count(), 0);
        assert_eq!(hub.client_count(), 0);

        let _rx = hub.subscribe("c1").unwrap();
        assert_eq!(hub.client_count(), 1);
        assert!(hub.unsubscribe("c1"));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn late_joiner_flow() {
        let hub = SyncHub::default();

        // 1. First client pushes two edits
        hub.push_events(PushEventRequest::new(vec![change("a", "c1"), change("b", "c1")]))
            .unwrap();

        // 2. It uploads the document, truncating the log
        let response = hub
            .upload_full(FullSyncRequest {
                client_id: "c1".into(),
                base_sequence_id: Some(2),
                document: vec![],
            })
            .unwrap();
        assert!(response.success);
        assert_eq!(hub.event_count(), 0);

        // 3. One more edit lands after the upload
        hub.push_events(PushEventRequest::new(vec![change("c", "c1")])).unwrap();

        // 4. A late joiner sees the document plus the trailing edit
        let full = hub.full_state();
        assert_eq!(full.document, Some(vec![]));
        assert_eq!(full.sequence_id, 3);
        assert_eq!(full.trailing_events.len(), 1);
        assert_eq!(full.trailing_events[0].sequence_id, 3);
    }

    #[test]
    fn sender_receives_its_own_events() {
        let hub = SyncHub::default();
        let mut rx1 = hub.subscribe("c1").unwrap();
        let mut rx2 = hub.subscribe("c2").unwrap();
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();

        hub.push_events(PushEventRequest::new(vec![change("a", "c1")])).unwrap();

        assert_eq!(next_event(&mut rx1).client_id(), Some("c1"));
        assert_eq!(next_event(&mut rx2).client_id(), Some("c1"));
    }

    #[test]
    fn injection_reaches_subscribers() {
        let hub = SyncHub::default();
        let mut rx = hub.subscribe("c1").unwrap();
        rx.try_recv().unwrap();

        hub.inject_images(vec!["https://img/a.png".into()]).unwrap();

        match next_event(&mut rx) {
            EventPayload::AddImage(data) => assert_eq!(data.urls, vec!["https://img/a.png"]),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn reset_keeps_subscribers() {
        let hub = SyncHub::default();
        let _rx = hub.subscribe("c1").unwrap();
        hub.push_events(PushEventRequest::new(vec![change("a", "c1")])).unwrap();

        hub.reset();
        assert_eq!(hub.sequence_id(), 0);
        assert_eq!(hub.full_state().document, None);
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.status().connected_clients, vec!["c1".to_string()]);
    }

    #[test]
    fn shared_log() {
        let log = Arc::new(EventLog::new());
        let hub = SyncHub::with_log(HubConfig::default(), Arc::clone(&log));

        hub.push_events(PushEventRequest::new(vec![change("a", "c1")])).unwrap();

        assert_eq!(log.len(), 1);
    }
}
