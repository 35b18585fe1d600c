//! HTTP transport implementation.
//!
//! Requests and responses are JSON. The push channel is a server-sent
//! event stream: each `data:` field carries one JSON frame, comment lines
//! (`: heartbeat`) keep the connection alive and are ignored.
//!
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, an in-process loopback).

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{LiveChannel, SyncTransport};
use async_trait::async_trait;
use easel_protocol::endpoint::{EVENT_PATH, FULL_DATA_PATH, FULL_UPLOAD_PATH, STREAM_PATH};
use easel_protocol::{FullState, FullSyncRequest, FullSyncResponse, PushEventRequest, PushEventResponse};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Failure reported by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// HTTP status, if a response was received.
    pub status: Option<u16>,
    /// Error message.
    pub message: String,
}

impl HttpError {
    /// A failure with no response (connection refused, reset, ...).
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// A failure with an HTTP status.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        match err.status {
            Some(status) if (400..500).contains(&status) => SyncError::transport_fatal(err.to_string()),
            Some(_) => SyncError::ServerError(err.to_string()),
            None => SyncError::transport_retryable(err.message),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request and returns the response body.
    async fn get(&self, url: &str) -> Result<Vec<u8>, HttpError>;

    /// Sends a POST request with a JSON body and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError>;

    /// Opens a server-sent event stream and yields it line by line.
    async fn open_stream(&self, url: &str) -> Result<mpsc::UnboundedReceiver<String>, HttpError>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "http://localhost:8080").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Per-request timeout.
    timeout: Duration,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(30),
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Creates a transport using the URL and timeout of `config`.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        Self::new(config.base_url.clone(), client).with_timeout(config.timeout)
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    async fn call<T, F>(&self, request: F) -> SyncResult<T>
    where
        F: Future<Output = Result<T, HttpError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => {
                self.set_error("request timed out");
                Err(SyncError::Timeout)
            }
            Ok(Err(e)) => {
                self.set_error(&e.to_string());
                Err(e.into())
            }
            Ok(Ok(value)) => {
                self.clear_error();
                Ok(value)
            }
        }
    }

    async fn get_json<Res: DeserializeOwned>(&self, path: &str) -> SyncResult<Res> {
        self.ensure_connected()?;
        let url = self.url(path);
        let body = self.call(self.client.get(&url)).await?;
        decode(&body)
    }

    async fn post_json<Req, Res>(&self, path: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Serialize + Sync + ?Sized,
        Res: DeserializeOwned,
    {
        self.ensure_connected()?;
        let body = serde_json::to_vec(request)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {}", e)))?;
        let url = self.url(path);
        let response = self.call(self.client.post(&url, body)).await?;
        decode(&response)
    }
}

fn decode<Res: DeserializeOwned>(body: &[u8]) -> SyncResult<Res> {
    serde_json::from_slice(body)
        .map_err(|e| SyncError::Protocol(format!("failed to decode response: {}", e)))
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn fetch_full_state(&self) -> SyncResult<FullState> {
        self.get_json(FULL_DATA_PATH).await
    }

    async fn push_events(&self, request: &PushEventRequest) -> SyncResult<PushEventResponse> {
        self.post_json(EVENT_PATH, request).await
    }

    async fn upload_full_state(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.post_json(FULL_UPLOAD_PATH, request).await
    }

    async fn subscribe(&self, client_id: &str) -> SyncResult<LiveChannel> {
        self.ensure_connected()?;
        let url = format!(
            "{}{}?clientId={}",
            self.base_url,
            STREAM_PATH,
            urlencoding::encode(client_id)
        );
        let mut lines = self.call(self.client.open_stream(&url)).await?;

        let (tx, channel) = LiveChannel::pair();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(line) = lines.recv().await {
                if let Some(frame) = decoder.push_line(&line) {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            }
            debug!(client_id = %client_id, "event stream ended");
        });
        Ok(channel)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    async fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Incremental server-sent event decoder.
///
/// Collects `data:` lines and yields the joined payload when a blank line
/// ends the event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    data: Vec<String>,
}

impl SseDecoder {
    /// Feeds one line; returns a complete event payload, if any.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(payload);
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" | "id" | "retry" => {}
            other => warn!(field = other, "ignoring unknown event stream field"),
        }
        None
    }
}

/// Trait for in-process servers reachable through a [`LoopbackClient`].
pub trait LoopbackServer: Send + Sync {
    /// Handles a GET request.
    fn handle_get(&self, path: &str) -> Result<Vec<u8>, HttpError>;

    /// Handles a POST request.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError>;

    /// Opens the push channel of `client_id`; yields JSON frames.
    fn subscribe(&self, client_id: &str) -> Result<mpsc::UnboundedReceiver<String>, HttpError>;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead. Push frames are
/// re-encoded as server-sent event lines so the stream decoder is
/// exercised too.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

fn path_of(url: &str) -> &str {
    url.find("/api/").map(|i| &url[i..]).unwrap_or(url)
}

/// Percent-decoded value of a query parameter.
fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    let query = query.split_once('#').map_or(query, |(query, _)| query);
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        urlencoding::decode(value).ok().map(|value| value.into_owned())
    })
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn get(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        self.server.handle_get(path_of(url))
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
        self.server.handle_post(path_of(url), &body)
    }

    async fn open_stream(&self, url: &str) -> Result<mpsc::UnboundedReceiver<String>, HttpError> {
        let client_id = query_param(url, "clientId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HttpError::status(400, "missing clientId"))?;
        let mut frames = self.server.subscribe(&client_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if tx.send(format!("data: {}", frame)).is_err() || tx.send(String::new()).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestClient {
        response: RwLock<Option<Vec<u8>>>,
        error: RwLock<Option<HttpError>>,
        healthy: AtomicBool,
        delay: Option<Duration>,
        stream_url: RwLock<Option<String>>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: RwLock::new(None),
                error: RwLock::new(None),
                healthy: AtomicBool::new(true),
                delay: None,
                stream_url: RwLock::new(None),
            }
        }

        fn set_response(&self, resp: Vec<u8>) {
            *self.response.write() = Some(resp);
        }

        fn set_error(&self, err: HttpError) {
            *self.error.write() = Some(err);
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        async fn respond(&self) -> Result<Vec<u8>, HttpError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.error.read().clone() {
                return Err(err);
            }
            self.response
                .read()
                .clone()
                .ok_or_else(|| HttpError::network("no response set"))
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn get(&self, _url: &str) -> Result<Vec<u8>, HttpError> {
            self.respond().await
        }

        async fn post(&self, _url: &str, _body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
            self.respond().await
        }

        async fn open_stream(&self, url: &str) -> Result<mpsc::UnboundedReceiver<String>, HttpError> {
            *self.stream_url.write() = Some(url.to_string());
            let (tx, rx) = mpsc::unbounded_channel();
            for line in [
                ": heartbeat",
                "",
                r#"data: {"type":"connected"}"#,
                "",
                "event: message",
                r#"data: {"type":"connected","#,
                r#"data: "client_id":"c9"}"#,
                "",
            ] {
                let _ = tx.send(line.to_string());
            }
            Ok(rx)
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn transport_creation() {
        let transport = HttpTransport::new("http://localhost:8080/", TestClient::new());
        assert_eq!(transport.base_url(), "http://localhost:8080");
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn transport_disconnect() {
        let transport = HttpTransport::new("http://localhost:8080", TestClient::new());
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.fetch_full_state().await,
            Err(SyncError::NotConnected)
        ));
    }

    #[test]
    fn transport_unhealthy_client() {
        let client = TestClient::new();
        client.set_healthy(false);
        let transport = HttpTransport::new("http://localhost:8080", client);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn fetch_full_state_decodes_json() {
        let client = TestClient::new();
        client.set_response(br#"{"document":null,"sequence_id":42,"trailing_events":[]}"#.to_vec());

        let transport = HttpTransport::new("http://localhost:8080", client);
        let state = transport.fetch_full_state().await.unwrap();
        assert_eq!(state.sequence_id, 42);
        assert!(state.document.is_none());
    }

    #[tokio::test]
    async fn bad_body_is_protocol_error() {
        let client = TestClient::new();
        client.set_response(b"<html>".to_vec());

        let transport = HttpTransport::new("http://localhost:8080", client);
        assert!(matches!(
            transport.fetch_full_state().await,
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn status_errors_map_to_sync_errors() {
        let client = TestClient::new();
        client.set_error(HttpError::status(400, "empty events"));
        let transport = HttpTransport::new("http://localhost:8080", client);

        let err = transport
            .push_events(&PushEventRequest::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(transport.last_error().unwrap().contains("empty events"));

        transport.client().set_error(HttpError::status(503, "unavailable"));
        let err = transport.fetch_full_state().await.unwrap_err();
        assert!(matches!(err, SyncError::ServerError(_)));

        transport.client().set_error(HttpError::network("connection refused"));
        let err = transport.fetch_full_state().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let mut client = TestClient::new();
        client.delay = Some(Duration::from_secs(60));
        client.set_response(b"{}".to_vec());

        let transport =
            HttpTransport::new("http://localhost:8080", client).with_timeout(Duration::from_millis(50));
        assert!(matches!(
            transport.fetch_full_state().await,
            Err(SyncError::Timeout)
        ));
    }

    #[tokio::test]
    async fn subscribe_decodes_event_stream() {
        let transport = HttpTransport::new("http://localhost:8080", TestClient::new());
        let mut channel = transport.subscribe("c9").await.unwrap();

        assert_eq!(channel.recv().await.as_deref(), Some(r#"{"type":"connected"}"#));
        assert_eq!(
            channel.recv().await.as_deref(),
            Some("{\"type\":\"connected\",\n\"client_id\":\"c9\"}")
        );
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_escapes_client_id() {
        let transport = HttpTransport::new("http://localhost:8080", TestClient::new());
        let _channel = transport.subscribe("team&1 #2").await.unwrap();

        let url = transport.client().stream_url.read().clone().unwrap();
        assert!(url.ends_with("?clientId=team%261%20%232"));
        assert_eq!(query_param(&url, "clientId").as_deref(), Some("team&1 #2"));
    }

    #[test]
    fn sse_decoder_ignores_comments() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push_line(": heartbeat"), None);
        assert_eq!(decoder.push_line(""), None);
        assert_eq!(decoder.push_line("data:{\"a\":1}\r"), None);
        assert_eq!(decoder.push_line("\r"), Some("{\"a\":1}".to_string()));
    }

    #[test]
    fn url_helpers() {
        assert_eq!(path_of("http://h:1/api/canvas/sync/event"), "/api/canvas/sync/event");
        assert_eq!(
            query_param("http://h/sse?x=1&clientId=abc", "clientId").as_deref(),
            Some("abc")
        );
        assert_eq!(
            query_param("http://h/sse?clientId=team%261%20b#frag", "clientId").as_deref(),
            Some("team&1 b")
        );
        assert_eq!(query_param("http://h/sse", "clientId"), None);
    }
}
