//! URL computation for the HTTP transports.

use serde_json::Value;
use url::Url;

use crate::error::{McpError, McpResult};

fn parse_base(base: &str) -> McpResult<Url> {
    Url::parse(base.trim()).map_err(|e| McpError::connection(format!("invalid url '{}': {}", base, e)))
}

/// The GET URL for an SSE server: `base`, or `base + "/sse"` when the path
/// does not already end in `/sse`. The query string is kept.
pub fn sse_url(base: &str) -> McpResult<Url> {
    let mut url = parse_base(base)?;
    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/sse") {
        url.set_path(&format!("{}/sse", path));
    }
    Ok(url)
}

/// The single endpoint for a streamable HTTP server.
///
/// A base whose path has an `mcp` segment is used unchanged. Otherwise the path is
/// replaced with `/mcp` on the same scheme, host and port, and the original
/// query parameters are carried over.
pub fn streamable_endpoint(base: &str) -> McpResult<Url> {
    let mut url = parse_base(base)?;
    let has_mcp_segment = url
        .path_segments()
        .map_or(false, |mut segments| segments.any(|segment| segment == "mcp"));
    if !has_mcp_segment {
        url.set_path("/mcp");
    }
    url.set_fragment(None);
    Ok(url)
}

/// Resolve the message endpoint announced by an SSE server.
///
/// `data` is either JSON `{"uri": "..."}` or a bare path/URL. Relative values
/// resolve against the SSE URL.
pub fn resolve_message_endpoint(sse_url: &Url, data: &str) -> McpResult<Url> {
    let data = data.trim();
    let target = if data.starts_with('{') {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| McpError::protocol(format!("malformed endpoint event: {}", e)))?;
        ["uri", "url", "endpoint"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| McpError::protocol("endpoint event has no uri"))?
    } else {
        data.to_string()
    };

    if target.is_empty() {
        return Err(McpError::protocol("endpoint event is empty"));
    }

    match Url::parse(&target) {
        Ok(absolute) => Ok(absolute),
        Err(url::ParseError::RelativeUrlWithoutBase) => sse_url
            .join(&target)
            .map_err(|e| McpError::protocol(format!("invalid endpoint '{}': {}", target, e))),
        Err(e) => Err(McpError::protocol(format!("invalid endpoint '{}': {}", target, e))),
    }
}
