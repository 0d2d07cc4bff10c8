//! Legacy HTTP+SSE transport.
//!
//! The client holds a long-lived GET event stream. The server first announces
//! a message endpoint with an `endpoint` event; requests are POSTed there and
//! responses come back as `message` events on the stream.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Response;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use mcpgate_core::{ServerSpec, TransportKind};

use super::http::{self, APPLICATION_JSON, EVENT_STREAM, LAST_EVENT_ID_HEADER};
use crate::client::{
    spawn_heartbeat, ClientOptions, ConnectionState, Heartbeat, PendingRequests, ProtocolClient,
    Session,
};
use crate::codec;
use crate::endpoint;
use crate::error::{McpError, McpResult};
use crate::protocol::{Inbound, JsonRpcNotification, JsonRpcRequest};
use crate::sse::{SseEvent, ENDPOINT_EVENT, MESSAGE_EVENT};

/// Stream position and negotiated resume support.
#[derive(Debug, Default)]
struct StreamState {
    /// Where requests are POSTed, once the server has announced it.
    endpoint: Option<Url>,
    last_event_id: Option<u64>,
    resume_supported: bool,
}

impl StreamState {
    /// Record an event id. Ids only move forward.
    fn observe_id(&mut self, id: u64) {
        if self.last_event_id.map_or(true, |last| id > last) {
            self.last_event_id = Some(id);
        }
    }

    /// The `Last-Event-ID` to send on reconnect, if the server can resume.
    fn resume_from(&self) -> Option<u64> {
        if self.resume_supported {
            self.last_event_id
        } else {
            None
        }
    }
}

/// MCP client for a server speaking HTTP+SSE.
pub struct SseClient {
    /// Handle to ourselves for the stream and heartbeat tasks.
    this: Weak<SseClient>,
    /// Server description, including extra headers.
    spec: ServerSpec,
    /// Heartbeat and reconnection tuning.
    options: ClientOptions,
    /// State, server info and request ids.
    session: Session,
    /// HTTP client carrying the spec's headers.
    http: reqwest::Client,
    /// GET URL of the event stream.
    sse_url: Url,
    /// Requests waiting for a `message` event.
    pending: PendingRequests,
    /// Message endpoint and stream position.
    stream: Mutex<StreamState>,
    /// Cancels the stream reader and heartbeat of the current connection.
    worker: Mutex<Option<CancellationToken>>,
    /// Serializes connect, disconnect and close.
    lifecycle: tokio::sync::Mutex<()>,
}

impl SseClient {
    /// Create a client for an SSE server. The stream is opened on
    /// [`ProtocolClient::connect`].
    ///
    /// # Arguments
    ///
    /// * `spec` - An SSE spec; `/sse` is appended to its URL unless already present
    /// * `options` - Transport tuning, usually from [`ClientOptions::from`] the config
    ///
    /// # Errors
    ///
    /// Fails when the URL does not parse or a header is not a valid HTTP header.
    pub fn new(spec: ServerSpec, options: ClientOptions) -> McpResult<Arc<Self>> {
        let sse_url = endpoint::sse_url(spec.url.as_deref().unwrap_or_default())?;
        let http = http::build_http_client(&spec)?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            session: Session::new(&spec, &options),
            spec,
            options,
            http,
            sse_url,
            pending: PendingRequests::new(),
            stream: Mutex::new(StreamState::default()),
            worker: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }

    /// The URL of the event stream.
    pub fn sse_url(&self) -> &Url {
        &self.sse_url
    }

    /// The message endpoint announced by the server, once known.
    pub fn message_endpoint(&self) -> Option<Url> {
        self.stream.lock().endpoint.clone()
    }

    pub fn last_event_id(&self) -> Option<u64> {
        self.stream.lock().last_event_id
    }

    fn stop_worker(&self) {
        if let Some(cancel) = self.worker.lock().take() {
            cancel.cancel();
        }
    }

    async fn open_stream(&self, last_event_id: Option<u64>) -> McpResult<Response> {
        let mut request = self.http.get(self.sse_url.clone()).header(ACCEPT, EVENT_STREAM);
        if let Some(id) = last_event_id {
            request = request.header(LAST_EVENT_ID_HEADER, id.to_string());
        }

        debug!(server = %self.spec.id, url = %self.sse_url, resume_from = ?last_event_id, "Opening SSE stream");
        let response = tokio::time::timeout(self.session.timeout(), request.send())
            .await
            .map_err(|_| McpError::timeout("opening SSE stream", self.session.timeout()))??;
        http::check_status(response, "SSE GET").await
    }

    /// Open a fresh stream and wait for the handshake driven by its events.
    async fn open_session(&self) -> McpResult<()> {
        self.stop_worker();
        *self.stream.lock() = StreamState::default();
        self.session.set_state(ConnectionState::Connecting);

        let response = match self.open_stream(None).await {
            Ok(response) => response,
            Err(e) => {
                self.session.record_error(&e);
                self.session.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let this = self.this.upgrade().ok_or(McpError::ConnectionClosed)?;
        let cancel = CancellationToken::new();
        *self.worker.lock() = Some(cancel.clone());
        tokio::spawn(this.run_stream(response, cancel.clone()));
        spawn_heartbeat(
            self.this.clone(),
            self.options.heartbeat_interval,
            self.options.missed_heartbeats,
            cancel.child_token(),
        );

        match self.session.wait_ready().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(server = %self.spec.id, error = %e, "SSE connection failed");
                self.stop_worker();
                self.pending.fail_all(&McpError::ConnectionClosed);
                self.session.record_error(&e);
                self.session.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Consume the stream, reconnecting when it drops, until cancelled or
    /// reconnection is exhausted.
    async fn run_stream(self: Arc<Self>, mut response: Response, cancel: CancellationToken) {
        loop {
            let outcome = http::read_events(response, &cancel, |event| self.handle_event(event, &cancel)).await;
            if cancel.is_cancelled() {
                return;
            }

            match &outcome {
                Ok(()) => warn!(server = %self.spec.id, "SSE stream ended"),
                Err(e) => warn!(server = %self.spec.id, error = %e, "SSE stream failed"),
            }
            self.pending.fail_all(&McpError::ConnectionClosed);
            self.session.transition(ConnectionState::Ready, ConnectionState::Degraded);

            match self.reconnect(&cancel).await {
                Some(next) => response = next,
                None => {
                    if !cancel.is_cancelled() {
                        warn!(server = %self.spec.id, "SSE reconnection exhausted");
                        self.session.record_error("SSE stream lost");
                        self.session.set_state(ConnectionState::Disconnected);
                        self.stop_worker();
                    }
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<Response> {
        for attempt in 1..=self.options.reconnect_attempts {
            let delay = http::reconnect_delay(self.options.reconnect_delay, attempt);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let resume_from = self.stream.lock().resume_from();
            if resume_from.is_none() {
                let mut stream = self.stream.lock();
                stream.endpoint = None;
                stream.last_event_id = None;
                self.session.set_state(ConnectionState::Connecting);
            }

            match self.open_stream(resume_from).await {
                Ok(response) => {
                    info!(server = %self.spec.id, attempt, resumed = resume_from.is_some(), "SSE stream re-established");
                    if resume_from.is_some() {
                        self.session.transition(ConnectionState::Degraded, ConnectionState::Ready);
                    }
                    return Some(response);
                }
                Err(e) => warn!(server = %self.spec.id, attempt, error = %e, "SSE reconnect failed"),
            }
        }
        None
    }

    fn handle_event(&self, event: SseEvent, cancel: &CancellationToken) {
        if let Some(id) = event.numeric_id() {
            self.stream.lock().observe_id(id);
        }
        if event.is_id_only() {
            return;
        }

        match event.kind() {
            ENDPOINT_EVENT => self.handle_endpoint(&event.data, cancel),
            MESSAGE_EVENT => self.handle_message(&event.data),
            other => debug!(server = %self.spec.id, event = %other, "Ignoring SSE event"),
        }
    }

    fn handle_endpoint(&self, data: &str, cancel: &CancellationToken) {
        let url = match endpoint::resolve_message_endpoint(&self.sse_url, data) {
            Ok(url) => url,
            Err(e) => {
                warn!(server = %self.spec.id, error = %e, "Ignoring bad endpoint event");
                return;
            }
        };
        debug!(server = %self.spec.id, endpoint = %url, "Received message endpoint");
        self.stream.lock().endpoint = Some(url);

        // The handshake response arrives on this same stream, so it must not
        // run on the event loop.
        if self.session.state() == ConnectionState::Connecting {
            if let Some(this) = self.this.upgrade() {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    match this.session.handshake(this.as_ref()).await {
                        Ok(info) => {
                            this.stream.lock().resume_supported = info.capabilities.supports_resume();
                        }
                        Err(e) => {
                            warn!(server = %this.spec.id, error = %e, "SSE handshake failed");
                            this.session.record_error(&e);
                            this.session.set_state(ConnectionState::Disconnected);
                            cancel.cancel();
                        }
                    }
                });
            }
        }
    }

    fn handle_message(&self, data: &str) {
        let message: Value = match serde_json::from_str(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(server = %self.spec.id, error = %e, "Skipping non-JSON SSE message");
                return;
            }
        };

        match Inbound::classify(&message) {
            Inbound::Response(id) => {
                if !self.pending.complete(id, message) {
                    debug!(server = %self.spec.id, id, "Dropping response for unknown request");
                }
            }
            Inbound::Other(method) => debug!(server = %self.spec.id, method = %method, "Ignoring server message"),
            Inbound::Unknown => debug!(server = %self.spec.id, "Ignoring unrecognized message"),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> McpResult<Response> {
        let endpoint = self
            .message_endpoint()
            .ok_or_else(|| McpError::connection("message endpoint not yet announced"))?;
        let response = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .json(body)
            .send()
            .await?;
        http::check_status(response, "SSE POST").await
    }
}

#[async_trait]
impl ProtocolClient for SseClient {
    fn session(&self) -> &Session {
        &self.session
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self) -> McpResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.session.state() {
            ConnectionState::Ready | ConnectionState::Degraded => Ok(()),
            ConnectionState::Closed => Err(McpError::ConnectionClosed),
            _ => self.open_session().await,
        }
    }

    async fn disconnect(&self) -> McpResult<()> {
        if self.session.state() != ConnectionState::Closed {
            self.session.set_state(ConnectionState::Disconnected);
        }
        self.stop_worker();
        self.pending.fail_all(&McpError::ConnectionClosed);

        let _lifecycle = self.lifecycle.lock().await;
        self.stream.lock().endpoint = None;
        info!(server = %self.spec.id, "Disconnected from SSE server");
        Ok(())
    }

    async fn close(&self) {
        if self.session.set_state(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.stop_worker();
        self.pending.fail_all(&McpError::ConnectionClosed);

        let _lifecycle = self.lifecycle.lock().await;
        self.stream.lock().endpoint = None;
        info!(server = %self.spec.id, "Closed MCP client");
    }

    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<Value> {
        let id = request
            .numeric_id()
            .ok_or_else(|| McpError::protocol("request id must be numeric"))?;

        // Register before POSTing so a fast response on the stream is not lost.
        let waiter = self.pending.register(id);
        debug!(server = %self.spec.id, id, method = %request.method, "Sending request");
        let response = self.post(&request).await?;

        // Some servers answer in the POST body instead of on the stream.
        if http::content_type(&response) == APPLICATION_JSON {
            if let Ok(body) = response.json::<Value>().await {
                if Inbound::classify(&body) == Inbound::Response(id) {
                    return Ok(body);
                }
            }
        }

        waiter.wait().await
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> McpResult<()> {
        self.post(&notification).await?;
        Ok(())
    }
}

#[async_trait]
impl Heartbeat for SseClient {
    fn heartbeat_session(&self) -> &Session {
        &self.session
    }

    async fn probe(&self) -> McpResult<()> {
        let id = self.session.next_id();
        self.request(codec::list_tools(id)).await.map(|_| ())
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl std::fmt::Debug for SseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseClient")
            .field("server", &self.spec.id)
            .field("url", &self.sse_url.as_str())
            .field("state", &self.session.state())
            .finish()
    }
}
