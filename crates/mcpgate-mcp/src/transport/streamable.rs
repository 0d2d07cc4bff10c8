//! Streamable HTTP transport.
//!
//! Every request is POSTed to a single `/mcp` endpoint. The server answers
//! with a JSON body, an SSE stream scoped to the request, or `202 Accepted`
//! with the response delivered later on an optional GET event stream.
//! The session is tracked through the `Mcp-Session-Id` header.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use mcpgate_core::{ServerSpec, TransportKind};

use super::http::{
    self, APPLICATION_JSON, EVENT_STREAM, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER,
};
use crate::client::{
    spawn_heartbeat, ClientOptions, ConnectionState, Heartbeat, PendingRequests, ProtocolClient,
    Session,
};
use crate::codec;
use crate::endpoint;
use crate::error::{McpError, McpResult};
use crate::protocol::{Inbound, JsonRpcNotification, JsonRpcRequest, ToolDescriptor};
use crate::sse::{SseEvent, SseParser};

const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Event types a streamable server may send on its GET stream.
const STREAM_EVENTS: [&str; 4] = ["message", "notification", "progress", "resume"];

/// Session bookkeeping carried between requests.
#[derive(Debug, Default)]
struct HttpSession {
    session_id: Option<String>,
    last_event_id: Option<u64>,
    resume_supported: bool,
}

impl HttpSession {
    fn observe_id(&mut self, id: u64) {
        if self.last_event_id.map_or(true, |last| id > last) {
            self.last_event_id = Some(id);
        }
    }

    fn resume_from(&self) -> Option<u64> {
        if self.resume_supported {
            self.last_event_id
        } else {
            None
        }
    }
}

/// MCP client for a server speaking streamable HTTP.
pub struct StreamableHttpClient {
    /// Handle to ourselves for the stream and heartbeat tasks.
    this: Weak<StreamableHttpClient>,
    /// Server description, including extra headers.
    spec: ServerSpec,
    /// Heartbeat and reconnection tuning.
    options: ClientOptions,
    /// State, server info and request ids.
    session: Session,
    /// HTTP client carrying the spec's headers.
    http: reqwest::Client,
    /// The `/mcp` endpoint every request goes to.
    endpoint: Url,
    /// Requests answered later on the GET stream.
    pending: PendingRequests,
    /// Session id and stream position.
    state: Mutex<HttpSession>,
    /// Last `tools/list` result, dropped when a heartbeat fails.
    tool_cache: Mutex<Option<Vec<ToolDescriptor>>>,
    /// Cancels the stream reader and heartbeat of the current connection.
    worker: Mutex<Option<CancellationToken>>,
    /// Whether the optional GET stream is currently open.
    stream_open: Mutex<bool>,
    /// Serializes connect, disconnect and close.
    lifecycle: tokio::sync::Mutex<()>,
}

impl StreamableHttpClient {
    /// Create a client for a streamable HTTP server.
    ///
    /// # Arguments
    ///
    /// * `spec` - A STREAMABLE_HTTP spec; its URL is mapped onto the `/mcp` endpoint
    /// * `options` - Transport tuning, usually from [`ClientOptions::from`] the config
    ///
    /// # Errors
    ///
    /// Fails when the URL does not parse or a header is not a valid HTTP header.
    pub fn new(spec: ServerSpec, options: ClientOptions) -> McpResult<Arc<Self>> {
        let endpoint = endpoint::streamable_endpoint(spec.url.as_deref().unwrap_or_default())?;
        let http = http::build_http_client(&spec)?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            session: Session::new(&spec, &options),
            spec,
            options,
            http,
            endpoint,
            pending: PendingRequests::new(),
            state: Mutex::new(HttpSession::default()),
            tool_cache: Mutex::new(None),
            worker: Mutex::new(None),
            stream_open: Mutex::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    /// True while the optional GET event stream is open.
    pub fn has_event_stream(&self) -> bool {
        *self.stream_open.lock()
    }

    pub fn invalidate_tool_cache(&self) {
        self.tool_cache.lock().take();
    }

    fn stop_worker(&self) {
        if let Some(cancel) = self.worker.lock().take() {
            cancel.cancel();
        }
        *self.stream_open.lock() = false;
    }

    fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session_id() {
            Some(id) => request.header(SESSION_ID_HEADER, id),
            None => request,
        }
    }

    fn capture_session_id(&self, response: &Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };

        let mut state = self.state.lock();
        if state.session_id.as_deref() != Some(id) {
            debug!(server = %self.spec.id, session_id = %id, "Server assigned session id");
            state.session_id = Some(id.to_string());
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> McpResult<Response> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .header(ACCEPT, format!("{}, {}", APPLICATION_JSON, EVENT_STREAM))
            .json(body);
        let response = self.with_session(request).send().await?;

        if response.status() == StatusCode::NOT_FOUND && self.state.lock().session_id.take().is_some() {
            warn!(server = %self.spec.id, "Session expired on server, cleared session id");
            return Err(McpError::connection("session expired (HTTP 404)"));
        }

        let response = http::check_status(response, "streamable HTTP POST").await?;
        self.capture_session_id(&response);
        Ok(response)
    }

    /// Try to open the optional GET event stream. Servers without one answer
    /// with an error status or a non-stream content type.
    async fn open_event_stream(&self, cancel: &CancellationToken) -> bool {
        let resume_from = self.state.lock().resume_from();
        match self.get_stream(resume_from).await {
            Ok(Some(response)) => {
                if let Some(this) = self.this.upgrade() {
                    *self.stream_open.lock() = true;
                    tokio::spawn(this.run_stream(response, cancel.clone()));
                    debug!(server = %self.spec.id, "Opened GET event stream");
                    return true;
                }
                false
            }
            Ok(None) => {
                debug!(server = %self.spec.id, "Server offers no GET stream, using POST only");
                false
            }
            Err(e) => {
                debug!(server = %self.spec.id, error = %e, "GET event stream unavailable");
                false
            }
        }
    }

    async fn get_stream(&self, last_event_id: Option<u64>) -> McpResult<Option<Response>> {
        let mut request = self.http.get(self.endpoint.clone()).header(ACCEPT, EVENT_STREAM);
        if let Some(id) = last_event_id {
            request = request.header(LAST_EVENT_ID_HEADER, id.to_string());
        }
        let response = tokio::time::timeout(self.session.timeout(), self.with_session(request).send())
            .await
            .map_err(|_| McpError::timeout("opening event stream", self.session.timeout()))??;

        if !response.status().is_success() || http::content_type(&response) != EVENT_STREAM {
            return Ok(None);
        }
        self.capture_session_id(&response);
        Ok(Some(response))
    }

    async fn run_stream(self: Arc<Self>, mut response: Response, cancel: CancellationToken) {
        loop {
            let outcome = http::read_events(response, &cancel, |event| self.handle_stream_event(event)).await;
            if cancel.is_cancelled() {
                return;
            }
            *self.stream_open.lock() = false;
            match &outcome {
                Ok(()) => warn!(server = %self.spec.id, "Event stream ended"),
                Err(e) => warn!(server = %self.spec.id, error = %e, "Event stream failed"),
            }
            self.pending.fail_all(&McpError::ConnectionClosed);

            match self.reconnect_stream(&cancel).await {
                Some(next) => {
                    *self.stream_open.lock() = true;
                    response = next;
                }
                None => {
                    if !cancel.is_cancelled() {
                        warn!(server = %self.spec.id, "Event stream reconnection exhausted, continuing with POST only");
                    }
                    return;
                }
            }
        }
    }

    async fn reconnect_stream(&self, cancel: &CancellationToken) -> Option<Response> {
        for attempt in 1..=self.options.reconnect_attempts {
            let delay = http::reconnect_delay(self.options.reconnect_delay, attempt);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let resume_from = self.state.lock().resume_from();
            match self.get_stream(resume_from).await {
                Ok(Some(response)) => {
                    info!(server = %self.spec.id, attempt, resumed = resume_from.is_some(), "Event stream re-established");
                    return Some(response);
                }
                Ok(None) => {
                    debug!(server = %self.spec.id, attempt, "Server declined event stream");
                    return None;
                }
                Err(e) => warn!(server = %self.spec.id, attempt, error = %e, "Event stream reconnect failed"),
            }
        }
        None
    }

    /// Handle an event from the GET stream.
    fn handle_stream_event(&self, event: SseEvent) {
        if let Some(id) = event.numeric_id() {
            self.state.lock().observe_id(id);
        }
        if event.is_id_only() {
            return;
        }
        if !STREAM_EVENTS.contains(&event.kind()) {
            debug!(server = %self.spec.id, event = %event.kind(), "Ignoring event");
            return;
        }

        let Ok(message) = serde_json::from_str::<Value>(&event.data) else {
            debug!(server = %self.spec.id, "Skipping non-JSON event data");
            return;
        };
        self.dispatch(message);
    }

    /// Route a message that is not the answer to the request at hand.
    fn dispatch(&self, message: Value) {
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

    /// Pick the response to `id` out of a JSON body, dispatching the rest.
    fn take_from_body(&self, id: u64, body: Value) -> Option<Value> {
        let messages = match body {
            Value::Array(batch) => batch,
            single => vec![single],
        };

        let mut ours = None;
        for message in messages {
            if ours.is_none() && Inbound::classify(&message) == Inbound::Response(id) {
                ours = Some(message);
            } else {
                self.dispatch(message);
            }
        }
        ours
    }

    /// Read a per-request SSE stream until the response to `id` shows up.
    async fn take_from_stream(&self, id: u64, response: Response) -> McpResult<Option<Value>> {
        use futures::StreamExt;

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in parser.feed(&chunk) {
                if let Some(found) = self.take_from_event(id, event) {
                    return Ok(Some(found));
                }
            }
        }
        Ok(parser.finish().and_then(|event| self.take_from_event(id, event)))
    }

    fn take_from_event(&self, id: u64, event: SseEvent) -> Option<Value> {
        if let Some(event_id) = event.numeric_id() {
            self.state.lock().observe_id(event_id);
        }
        if event.is_id_only() {
            return None;
        }
        let body = serde_json::from_str::<Value>(&event.data).ok()?;
        self.take_from_body(id, body)
    }

    async fn delete_session(&self) {
        let Some(session_id) = self.state.lock().session_id.take() else {
            return;
        };
        let request = self
            .http
            .delete(self.endpoint.clone())
            .header(SESSION_ID_HEADER, session_id);
        match tokio::time::timeout(DELETE_TIMEOUT, request.send()).await {
            Ok(Ok(response)) => debug!(server = %self.spec.id, status = %response.status(), "Ended server session"),
            Ok(Err(e)) => debug!(server = %self.spec.id, error = %e, "Ending server session failed"),
            Err(_) => debug!(server = %self.spec.id, "Ending server session timed out"),
        }
    }

    fn teardown(&self) {
        self.stop_worker();
        self.pending.fail_all(&McpError::ConnectionClosed);
        self.invalidate_tool_cache();
    }
}

#[async_trait]
impl ProtocolClient for StreamableHttpClient {
    fn session(&self) -> &Session {
        &self.session
    }

    fn transport(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn connect(&self) -> McpResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.session.state() {
            ConnectionState::Ready | ConnectionState::Degraded => return Ok(()),
            ConnectionState::Closed => return Err(McpError::ConnectionClosed),
            _ => {}
        }

        self.stop_worker();
        *self.state.lock() = HttpSession::default();
        self.session.set_state(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        *self.worker.lock() = Some(cancel.clone());
        let mut stream_opened = self.open_event_stream(&cancel).await;

        match self.session.handshake(self).await {
            Ok(info) => {
                self.state.lock().resume_supported = info.capabilities.supports_resume();
            }
            Err(e) => {
                warn!(server = %self.spec.id, error = %e, "Streamable HTTP handshake failed");
                self.teardown();
                self.session.record_error(&e);
                self.session.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        // Servers that scope the GET stream to a session only accept it now.
        if !stream_opened && self.session_id().is_some() {
            stream_opened = self.open_event_stream(&cancel).await;
        }
        spawn_heartbeat(
            self.this.clone(),
            self.options.heartbeat_interval,
            self.options.missed_heartbeats,
            cancel.child_token(),
        );

        info!(
            server = %self.spec.id,
            session_id = ?self.session_id(),
            event_stream = stream_opened,
            "Connected to streamable HTTP server"
        );
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        if self.session.state() != ConnectionState::Closed {
            self.session.set_state(ConnectionState::Disconnected);
        }
        self.teardown();

        let _lifecycle = self.lifecycle.lock().await;
        self.delete_session().await;
        info!(server = %self.spec.id, "Disconnected from streamable HTTP server");
        Ok(())
    }

    async fn close(&self) {
        if self.session.set_state(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.teardown();

        let _lifecycle = self.lifecycle.lock().await;
        self.delete_session().await;
        info!(server = %self.spec.id, "Closed MCP client");
    }

    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<Value> {
        let id = request
            .numeric_id()
            .ok_or_else(|| McpError::protocol("request id must be numeric"))?;

        let waiter = self.pending.register(id);
        debug!(server = %self.spec.id, id, method = %request.method, "Sending request");
        let response = self.post(&request).await?;

        if response.status() == StatusCode::ACCEPTED {
            if !self.has_event_stream() {
                return Err(McpError::protocol(
                    "server accepted the request but has no event stream to answer on",
                ));
            }
            return waiter.wait().await;
        }

        let found = match http::content_type(&response).as_str() {
            EVENT_STREAM => self.take_from_stream(id, response).await?,
            _ => {
                let bytes = response.bytes().await?;
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    None
                } else {
                    let body: Value = serde_json::from_slice(&bytes)
                        .map_err(|e| McpError::protocol(format!("malformed response body: {}", e)))?;
                    self.take_from_body(id, body)
                }
            }
        };

        match found {
            Some(message) => Ok(message),
            None if self.has_event_stream() => waiter.wait().await,
            None => Err(McpError::protocol(format!("no response to request {} in reply", id))),
        }
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> McpResult<()> {
        self.post(&notification).await?;
        Ok(())
    }

    /// Tool lists are cached per client until a heartbeat fails or the
    /// client disconnects.
    async fn get_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        let cached = self.tool_cache.lock().clone();
        if let Some(tools) = cached {
            return Ok(tools);
        }

        let id = self.session.next_id();
        let result = self.request(codec::list_tools(id)).await?;
        let tools = codec::parse_tools(&self.spec.id, &result);
        debug!(server = %self.spec.id, tool_count = tools.len(), "Listed tools");
        *self.tool_cache.lock() = Some(tools.clone());
        Ok(tools)
    }
}

#[async_trait]
impl Heartbeat for StreamableHttpClient {
    fn heartbeat_session(&self) -> &Session {
        &self.session
    }

    async fn probe(&self) -> McpResult<()> {
        let id = self.session.next_id();
        self.request(codec::list_tools(id)).await.map(|_| ())
    }

    fn on_missed_heartbeat(&self) {
        self.invalidate_tool_cache();
    }
}

impl std::fmt::Debug for StreamableHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpClient")
            .field("server", &self.spec.id)
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &self.session.state())
            .finish()
    }
}
