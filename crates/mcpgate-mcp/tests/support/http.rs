//! In-process mock MCP servers for the HTTP transports.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Bind an ephemeral port and serve `router` in the background.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Answer one JSON-RPC request the way a small MCP server would.
/// Returns `None` for notifications.
pub fn answer(message: &Value, capabilities: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let params = &message["params"];
    let result = match message["method"].as_str().unwrap_or_default() {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": capabilities,
            "serverInfo": {"name": "mock-http", "version": "1.0.0"}
        }),
        "tools/list" => json!({
            "tools": [
                {"name": "echo", "description": "Echo the arguments"},
                {"name": "slow", "description": "Echo after `ms` milliseconds"}
            ]
        }),
        "tools/call" => json!({
            "content": [{"type": "text", "text": params["arguments"].to_string()}]
        }),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn requested_delay(message: &Value) -> Option<Duration> {
    if message["params"]["name"] == "slow" {
        let ms = message["params"]["arguments"]["ms"].as_u64().unwrap_or(100);
        return Some(Duration::from_millis(ms));
    }
    None
}

// ============================================================================
// HTTP+SSE
// ============================================================================

#[derive(Default)]
struct SseInner {
    sessions: Mutex<HashMap<u64, mpsc::UnboundedSender<Event>>>,
    next_session: AtomicU64,
    next_event: AtomicU64,
    resume: AtomicBool,
    answer_in_body: AtomicBool,
    streams_opened: AtomicUsize,
    last_event_ids: Mutex<Vec<Option<String>>>,
    api_keys: Mutex<Vec<Option<String>>>,
}

/// Legacy SSE server: `GET /sse` streams events, `POST /messages` accepts
/// requests and answers on the stream.
#[derive(Clone, Default)]
pub struct SseServer {
    inner: Arc<SseInner>,
}

#[derive(serde::Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: u64,
}

impl SseServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise resumable streams.
    pub fn with_resume(self) -> Self {
        self.inner.resume.store(true, Ordering::SeqCst);
        self
    }

    /// Answer in the POST body instead of on the stream.
    pub fn answering_in_body(self) -> Self {
        self.inner.answer_in_body.store(true, Ordering::SeqCst);
        self
    }

    /// Start serving and return the base URL.
    pub async fn start(&self) -> String {
        let router = Router::new()
            .route("/sse", get(sse_stream))
            .route("/messages", post(sse_message))
            .with_state(self.clone());
        format!("http://{}", serve(router).await)
    }

    /// End every open event stream.
    pub fn drop_streams(&self) {
        self.inner.sessions.lock().unwrap().clear();
    }

    pub fn streams_opened(&self) -> usize {
        self.inner.streams_opened.load(Ordering::SeqCst)
    }

    /// `Last-Event-ID` header of every GET, in order.
    pub fn last_event_ids(&self) -> Vec<Option<String>> {
        self.inner.last_event_ids.lock().unwrap().clone()
    }

    /// `X-Api-Key` header of every request, in order.
    pub fn api_keys(&self) -> Vec<Option<String>> {
        self.inner.api_keys.lock().unwrap().clone()
    }

    fn capabilities(&self) -> Value {
        if self.inner.resume.load(Ordering::SeqCst) {
            json!({"tools": {}, "experimental": {"resume": true}})
        } else {
            json!({"tools": {}})
        }
    }

    fn record_headers(&self, headers: &HeaderMap) {
        let key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.inner.api_keys.lock().unwrap().push(key);
    }

    fn message_event(&self, payload: &Value) -> Event {
        let id = self.inner.next_event.fetch_add(1, Ordering::SeqCst) + 1;
        Event::default()
            .event("message")
            .id(id.to_string())
            .data(payload.to_string())
    }
}

async fn sse_stream(
    State(server): State<SseServer>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    server.record_headers(&headers);
    server.inner.last_event_ids.lock().unwrap().push(
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    server.inner.streams_opened.fetch_add(1, Ordering::SeqCst);

    let session = server.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.inner.sessions.lock().unwrap().insert(session, tx);

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/messages?sessionId={}", session)));
        while let Some(event) = rx.recv().await {
            yield Ok(event);
        }
    };
    Sse::new(stream)
}

async fn sse_message(
    State(server): State<SseServer>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    server.record_headers(&headers);
    let Some(reply) = answer(&message, &server.capabilities()) else {
        return StatusCode::ACCEPTED.into_response();
    };

    if server.inner.answer_in_body.load(Ordering::SeqCst) {
        return Json(reply).into_response();
    }

    let Some(tx) = server.inner.sessions.lock().unwrap().get(&query.session_id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let event = server.message_event(&reply);
    match requested_delay(&message) {
        Some(delay) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            });
        }
        None => {
            let _ = tx.send(event);
        }
    }
    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// Streamable HTTP
// ============================================================================

/// How a streamable server answers POSTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// `application/json` body.
    #[default]
    Json,
    /// A `text/event-stream` body carrying the response.
    Stream,
    /// `202 Accepted`, with the response sent on the GET event stream.
    Accepted,
}

#[derive(Default)]
struct StreamableInner {
    mode: Mutex<ReplyMode>,
    issue_session: AtomicBool,
    expire_sessions: AtomicBool,
    failing: AtomicBool,
    resume: AtomicBool,
    stream: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    next_event: AtomicU64,
    streams_opened: AtomicUsize,
    last_event_ids: Mutex<Vec<Option<String>>>,
    tools_list_calls: AtomicUsize,
    session_headers: Mutex<Vec<Option<String>>>,
    queries: Mutex<Vec<Option<String>>>,
    deleted: Mutex<Vec<String>>,
}

/// Streamable HTTP server on `/mcp`. GET is refused unless the server runs in
/// [`ReplyMode::Accepted`], in which case it opens the event stream that
/// carries every response.
#[derive(Clone, Default)]
pub struct StreamableServer {
    inner: Arc<StreamableInner>,
}

impl StreamableServer {
    /// Server that assigns `Mcp-Session-Id: session-1` on initialize.
    pub fn new() -> Self {
        let server = Self::default();
        server.inner.issue_session.store(true, Ordering::SeqCst);
        server
    }

    /// Server that never assigns a session id.
    pub fn without_sessions() -> Self {
        Self::default()
    }

    pub fn with_mode(self, mode: ReplyMode) -> Self {
        *self.inner.mode.lock().unwrap() = mode;
        self
    }

    /// Advertise resumable streams.
    pub fn with_resume(self) -> Self {
        self.inner.resume.store(true, Ordering::SeqCst);
        self
    }

    /// Answer 404 to every request that carries a session id.
    pub fn expire_sessions(&self) {
        self.inner.expire_sessions.store(true, Ordering::SeqCst);
    }

    /// Answer every POST with a 500 while `failing` is set.
    pub fn fail_requests(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// End the open event stream.
    pub fn drop_stream(&self) {
        self.inner.stream.lock().unwrap().take();
    }

    pub fn streams_opened(&self) -> usize {
        self.inner.streams_opened.load(Ordering::SeqCst)
    }

    /// `Last-Event-ID` header of every GET, in order.
    pub fn last_event_ids(&self) -> Vec<Option<String>> {
        self.inner.last_event_ids.lock().unwrap().clone()
    }

    pub async fn start(&self) -> String {
        let router = Router::new()
            .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete))
            .with_state(self.clone());
        format!("http://{}", serve(router).await)
    }

    pub fn tools_list_calls(&self) -> usize {
        self.inner.tools_list_calls.load(Ordering::SeqCst)
    }

    /// `Mcp-Session-Id` header of every POST, in order.
    pub fn session_headers(&self) -> Vec<Option<String>> {
        self.inner.session_headers.lock().unwrap().clone()
    }

    /// Query string of every POST, in order.
    pub fn queries(&self) -> Vec<Option<String>> {
        self.inner.queries.lock().unwrap().clone()
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.inner.deleted.lock().unwrap().clone()
    }

    fn capabilities(&self) -> Value {
        if self.inner.resume.load(Ordering::SeqCst) {
            json!({"tools": {}, "experimental": {"resume": true}})
        } else {
            json!({"tools": {}})
        }
    }

    /// Send `payload` on whichever event stream is open when this runs.
    fn deliver(&self, payload: &Value) {
        let id = self.inner.next_event.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event::default()
            .event("message")
            .id(id.to_string())
            .data(payload.to_string());
        if let Some(tx) = self.inner.stream.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

async fn mcp_post(
    State(server): State<StreamableServer>,
    headers: HeaderMap,
    uri: Uri,
    Json(message): Json<Value>,
) -> Response {
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    server.inner.session_headers.lock().unwrap().push(session.clone());
    server
        .inner
        .queries
        .lock()
        .unwrap()
        .push(uri.query().map(str::to_string));

    if session.is_some() && server.inner.expire_sessions.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if server.inner.failing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if message["method"] == "tools/list" {
        server.inner.tools_list_calls.fetch_add(1, Ordering::SeqCst);
    }

    let Some(reply) = answer(&message, &server.capabilities()) else {
        return StatusCode::ACCEPTED.into_response();
    };

    let mode = *server.inner.mode.lock().unwrap();
    let mut response = match mode {
        ReplyMode::Json => Json(reply).into_response(),
        ReplyMode::Stream => {
            let events = vec![
                Ok::<_, Infallible>(Event::default().event("message").data(
                    json!({"jsonrpc": "2.0", "method": "notifications/progress"}).to_string(),
                )),
                Ok(Event::default().event("message").id("1").data(reply.to_string())),
            ];
            Sse::new(futures::stream::iter(events)).into_response()
        }
        ReplyMode::Accepted => {
            match requested_delay(&message) {
                Some(delay) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        server.deliver(&reply);
                    });
                }
                None => server.deliver(&reply),
            }
            StatusCode::ACCEPTED.into_response()
        }
    };

    if message["method"] == "initialize" && server.inner.issue_session.load(Ordering::SeqCst) {
        response
            .headers_mut()
            .insert("mcp-session-id", HeaderValue::from_static("session-1"));
    }
    response
}

async fn mcp_get(State(server): State<StreamableServer>, headers: HeaderMap) -> Response {
    if *server.inner.mode.lock().unwrap() != ReplyMode::Accepted {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    server.inner.last_event_ids.lock().unwrap().push(
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    server.inner.streams_opened.fetch_add(1, Ordering::SeqCst);

    let (tx, mut rx) = mpsc::unbounded_channel();
    *server.inner.stream.lock().unwrap() = Some(tx);

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().comment("stream open"));
        while let Some(event) = rx.recv().await {
            yield Ok(event);
        }
    };
    Sse::new(stream).into_response()
}

async fn mcp_delete(State(server): State<StreamableServer>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) {
        server.inner.deleted.lock().unwrap().push(session.to_string());
    }
    StatusCode::NO_CONTENT
}
