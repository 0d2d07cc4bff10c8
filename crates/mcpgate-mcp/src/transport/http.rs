//! Plumbing shared by the SSE and streamable HTTP transports.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use tokio_util::sync::CancellationToken;

use mcpgate_core::ServerSpec;

use crate::error::{McpError, McpResult};
use crate::sse::{SseEvent, SseParser};

pub(crate) const SESSION_ID_HEADER: &str = "mcp-session-id";
pub(crate) const LAST_EVENT_ID_HEADER: &str = "last-event-id";
pub(crate) const EVENT_STREAM: &str = "text/event-stream";
pub(crate) const APPLICATION_JSON: &str = "application/json";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client carrying the spec's extra headers on every request.
///
/// No overall request timeout is set: event streams stay open indefinitely and
/// round trips are bounded by the caller.
pub(crate) fn build_http_client(spec: &ServerSpec) -> McpResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &spec.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Validation(format!("{}: invalid header name '{}': {}", spec.id, name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Validation(format!("{}: invalid value for header '{}': {}", spec.id, name, e)))?;
        headers.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(McpError::from)
}

/// Media type of a response without parameters, lowercased.
pub(crate) fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Reject non-success statuses with the response body as context.
pub(crate) async fn check_status(response: Response, what: &str) -> McpResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, what, &body))
}

pub(crate) fn status_error(status: StatusCode, what: &str, body: &str) -> McpError {
    let body = body.trim();
    if body.is_empty() {
        McpError::connection(format!("{} failed with HTTP {}", what, status))
    } else {
        McpError::connection(format!("{} failed with HTTP {}: {}", what, status, body))
    }
}

/// Feed an event stream through `on_event` until it ends or `cancel` fires.
pub(crate) async fn read_events<F>(
    response: Response,
    cancel: &CancellationToken,
    mut on_event: F,
) -> McpResult<()>
where
    F: FnMut(SseEvent) + Send,
{
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed(&bytes) {
                    on_event(event);
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                if let Some(event) = parser.finish() {
                    on_event(event);
                }
                return Ok(());
            }
        }
    }
}

/// Linear backoff for stream reconnection: `attempt * step`.
pub(crate) fn reconnect_delay(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt)
}
