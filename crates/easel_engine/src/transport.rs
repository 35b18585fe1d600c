//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use easel_protocol::{
    FullState, FullSyncRequest, FullSyncResponse, PushEventRequest, PushEventResponse,
    SequencedEvent, ServerMessage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// A sync transport handles communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP with server-sent events, in-process, mock).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches the authoritative document state.
    async fn fetch_full_state(&self) -> SyncResult<FullState>;

    /// Pushes events; the response carries the last assigned sequence.
    async fn push_events(&self, request: &PushEventRequest) -> SyncResult<PushEventResponse>;

    /// Uploads a complete document.
    async fn upload_full_state(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse>;

    /// Opens the push channel for `client_id`.
    async fn subscribe(&self, client_id: &str) -> SyncResult<LiveChannel>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport.
    async fn close(&self) -> SyncResult<()>;
}

/// The receiving end of a push channel. Yields raw JSON frames.
#[derive(Debug)]
pub struct LiveChannel {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl LiveChannel {
    /// Wraps a frame receiver.
    pub fn new(receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self { receiver }
    }

    /// Creates a connected sender/channel pair.
    pub fn pair() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Waits for the next frame. Returns `None` once the sender is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Returns the next buffered frame without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Closes the channel; buffered frames can still be read.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// A scriptable transport for testing.
///
/// Pushes are recorded and answered with consecutive sequence numbers
/// unless a failure is scripted.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    full_state: Mutex<FullState>,
    sequence: Mutex<u64>,
    queue_length: Mutex<usize>,
    failures: Mutex<VecDeque<SyncError>>,
    pushed: Mutex<Vec<PushEventRequest>>,
    uploads: Mutex<Vec<FullSyncRequest>>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            full_state: Mutex::new(FullState::default()),
            sequence: Mutex::new(0),
            queue_length: Mutex::new(0),
            failures: Mutex::new(VecDeque::new()),
            pushed: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
        }
    }

    /// Sets the full state returned by `fetch_full_state`.
    pub fn set_full_state(&self, state: FullState) {
        *self.sequence.lock() = state.sequence_id;
        *self.full_state.lock() = state;
    }

    /// Sets the sequence counter used to answer pushes.
    pub fn set_sequence(&self, sequence_id: u64) {
        *self.sequence.lock() = sequence_id;
    }

    /// Makes the next transport call fail with `error`.
    pub fn fail_next(&self, error: SyncError) {
        self.failures.lock().push_back(error);
    }

    /// Returns the recorded push requests.
    pub fn pushed(&self) -> Vec<PushEventRequest> {
        self.pushed.lock().clone()
    }

    /// Returns the recorded full uploads.
    pub fn uploads(&self) -> Vec<FullSyncRequest> {
        self.uploads.lock().clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Delivers a raw frame to the subscribed channel.
    pub fn deliver_frame(&self, frame: impl Into<String>) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Delivers a sequenced event to the subscribed channel.
    pub fn deliver(&self, event: SequencedEvent) -> bool {
        match (ServerMessage::SyncEvent { data: event }).to_frame() {
            Ok(frame) => self.deliver_frame(frame),
            Err(_) => false,
        }
    }

    fn check(&self) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn fetch_full_state(&self) -> SyncResult<FullState> {
        self.check()?;
        Ok(self.full_state.lock().clone())
    }

    async fn push_events(&self, request: &PushEventRequest) -> SyncResult<PushEventResponse> {
        self.check()?;
        self.pushed.lock().push(request.clone());

        let mut sequence = self.sequence.lock();
        *sequence += request.events.len() as u64;
        let mut queue_length = self.queue_length.lock();
        *queue_length += request.events.len();

        Ok(PushEventResponse {
            sequence_id: *sequence,
            queue_length: *queue_length,
        })
    }

    async fn upload_full_state(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.check()?;
        self.uploads.lock().push(request.clone());
        *self.queue_length.lock() = 0;
        Ok(FullSyncResponse {
            success: true,
            sequence_id: *self.sequence.lock(),
        })
    }

    async fn subscribe(&self, _client_id: &str) -> SyncResult<LiveChannel> {
        self.check()?;
        let (tx, channel) = LiveChannel::pair();
        *self.sender.lock() = Some(tx);
        Ok(channel)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.sender.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_protocol::OutboundEvent;

    #[tokio::test]
    async fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.fetch_full_state().await,
            Err(SyncError::NotConnected)
        ));

        transport.set_connected(true);
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_assigns_sequences() {
        let transport = MockTransport::new();
        transport.set_sequence(10);

        let events = vec![
            OutboundEvent::add_image("e1", vec![]).unwrap(),
            OutboundEvent::add_image("e2", vec![]).unwrap(),
        ];
        let response = transport.push_events(&PushEventRequest::new(events)).await.unwrap();
        assert_eq!(response.sequence_id, 12);
        assert_eq!(response.queue_length, 2);
        assert_eq!(transport.pushed().len(), 1);
    }

    #[tokio::test]
    async fn mock_transport_scripted_failure() {
        let transport = MockTransport::new();
        transport.fail_next(SyncError::transport_retryable("connection reset"));

        assert!(transport.fetch_full_state().await.is_err());
        assert!(transport.fetch_full_state().await.is_ok());
    }

    #[tokio::test]
    async fn live_channel_delivery() {
        let transport = MockTransport::new();
        assert!(!transport.deliver_frame("{}"));

        let mut channel = transport.subscribe("c1").await.unwrap();
        assert!(transport.deliver_frame(r#"{"type":"connected"}"#));
        assert_eq!(channel.try_recv().as_deref(), Some(r#"{"type":"connected"}"#));
        assert!(channel.try_recv().is_none());

        transport.close().await.unwrap();
        assert!(channel.recv().await.is_none());
    }
}
