//! JSON-RPC request builders and response parsers.
//!
//! The codec holds no state. Each client owns its id counter and passes the
//! next id in, so every transport shares the same message shapes.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::error::{McpError, McpResult};
use crate::protocol::{
    methods, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PromptDescriptor, ResourceContents,
    ResourceDescriptor, ServerInfo, ToolDescriptor, ToolResult, JSONRPC_VERSION,
};

/// Tool arguments as callers supply them: strings, or null.
pub type ToolArguments = HashMap<String, Option<String>>;

/// A tool argument after type coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgument {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Json(Value),
}

impl ToolArgument {
    /// Re-type a caller-supplied string.
    ///
    /// Order: JSON object/array, integer, float, boolean (case-insensitive),
    /// otherwise the string itself.
    pub fn coerce(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Null;
        };

        let trimmed = raw.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value @ (Value::Object(_) | Value::Array(_))) =
                serde_json::from_str::<Value>(trimmed)
            {
                return Self::Json(value);
            }
        }

        if is_integer_literal(raw) {
            if let Ok(n) = raw.parse::<i64>() {
                return Self::Integer(n);
            }
            if let Ok(f) = raw.parse::<f64>() {
                return Self::Float(f);
            }
        }

        if is_float_literal(raw) {
            if let Ok(f) = raw.parse::<f64>() {
                if f.is_finite() {
                    return Self::Float(f);
                }
            }
        }

        if raw.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }

        Self::String(raw.to_string())
    }
}

impl From<ToolArgument> for Value {
    fn from(arg: ToolArgument) -> Self {
        match arg {
            ToolArgument::Null => Value::Null,
            ToolArgument::Bool(b) => Value::Bool(b),
            ToolArgument::Integer(n) => Value::Number(n.into()),
            ToolArgument::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            ToolArgument::String(s) => Value::String(s),
            ToolArgument::Json(v) => v,
        }
    }
}

/// `-?[0-9]+`
fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// `-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?`
fn is_float_literal(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    let (mantissa, exponent) = match body.find(|c: char| c == 'e' || c == 'E') {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };

    let Some((whole, frac)) = mantissa.split_once('.') else {
        return false;
    };
    let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !all_digits(frac) {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => all_digits(exp.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(exp)),
    }
}

/// Coerce every argument into a JSON object. Keys are emitted in sorted order.
pub fn coerce_arguments(args: &ToolArguments) -> Map<String, Value> {
    let sorted: BTreeMap<&String, &Option<String>> = args.iter().collect();
    sorted
        .into_iter()
        .map(|(key, value)| (key.clone(), ToolArgument::coerce(value.as_deref()).into()))
        .collect()
}

// ============================================================================
// Request builders
// ============================================================================

pub fn initialize(id: u64, client_info: &Implementation) -> JsonRpcRequest {
    let params = InitializeParams::new(client_info.clone());
    JsonRpcRequest::new(id, methods::INITIALIZE, serde_json::to_value(params).ok())
}

pub fn initialized() -> JsonRpcNotification {
    JsonRpcNotification::new(methods::INITIALIZED, None)
}

pub fn list_tools(id: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(id, methods::TOOLS_LIST, Some(Value::Object(Map::new())))
}

/// `tools/call`. The `arguments` object is always present.
pub fn call_tool(id: u64, name: &str, args: &ToolArguments) -> JsonRpcRequest {
    let mut params = Map::new();
    params.insert("name".into(), Value::String(name.to_string()));
    params.insert("arguments".into(), Value::Object(coerce_arguments(args)));
    JsonRpcRequest::new(id, methods::TOOLS_CALL, Some(Value::Object(params)))
}

pub fn list_resources(id: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(id, methods::RESOURCES_LIST, Some(Value::Object(Map::new())))
}

pub fn read_resource(id: u64, uri: &str) -> JsonRpcRequest {
    let mut params = Map::new();
    params.insert("uri".into(), Value::String(uri.to_string()));
    JsonRpcRequest::new(id, methods::RESOURCES_READ, Some(Value::Object(params)))
}

pub fn list_prompts(id: u64) -> JsonRpcRequest {
    JsonRpcRequest::new(id, methods::PROMPTS_LIST, Some(Value::Object(Map::new())))
}

/// `prompts/get`. Prompt arguments are strings on the wire, so no coercion.
pub fn get_prompt(id: u64, name: &str, args: &HashMap<String, String>) -> JsonRpcRequest {
    let arguments: Map<String, Value> = args
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut params = Map::new();
    params.insert("name".into(), Value::String(name.to_string()));
    params.insert("arguments".into(), Value::Object(arguments));
    JsonRpcRequest::new(id, methods::PROMPTS_GET, Some(Value::Object(params)))
}

// ============================================================================
// Response parsing
// ============================================================================

/// Validate a response envelope and return its `result`.
pub fn parse_response(message: Value) -> McpResult<Value> {
    let response: JsonRpcResponse = serde_json::from_value(message)
        .map_err(|e| McpError::protocol(format!("Failed to parse response: {}", e)))?;

    if response.jsonrpc != JSONRPC_VERSION {
        return Err(McpError::protocol(format!(
            "unexpected jsonrpc version '{}'",
            response.jsonrpc
        )));
    }

    if let Some(error) = response.error {
        return Err(McpError::server_error(error.code, error.message));
    }

    Ok(response.result.unwrap_or(Value::Null))
}

/// Parse the `initialize` result. Anything malformed is a handshake failure.
pub fn parse_initialize(result: Value) -> McpResult<ServerInfo> {
    let parsed: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::handshake(format!("malformed initialize result: {}", e)))?;
    Ok(parsed.into())
}

/// Parse `result[field]` item by item, skipping entries that do not parse.
fn parse_list<T: DeserializeOwned>(server_id: &str, result: &Value, field: &str) -> Vec<T> {
    let Some(items) = result.get(field).and_then(Value::as_array) else {
        warn!(server = %server_id, field, "List result missing array, treating as empty");
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(server = %server_id, field, index, error = %e, "Skipping malformed entry");
                None
            }
        })
        .collect()
}

pub fn parse_tools(server_id: &str, result: &Value) -> Vec<ToolDescriptor> {
    parse_list::<ToolDescriptor>(server_id, result, "tools")
        .into_iter()
        .map(|mut tool| {
            tool.server_id = server_id.to_string();
            tool
        })
        .collect()
}

pub fn parse_resources(server_id: &str, result: &Value) -> Vec<ResourceDescriptor> {
    parse_list::<ResourceDescriptor>(server_id, result, "resources")
        .into_iter()
        .map(|mut resource| {
            resource.server_id = server_id.to_string();
            resource
        })
        .collect()
}

pub fn parse_prompts(server_id: &str, result: &Value) -> Vec<PromptDescriptor> {
    parse_list::<PromptDescriptor>(server_id, result, "prompts")
        .into_iter()
        .map(|mut prompt| {
            prompt.server_id = server_id.to_string();
            prompt
        })
        .collect()
}

pub fn parse_resource_contents(server_id: &str, result: &Value) -> Vec<ResourceContents> {
    parse_list(server_id, result, "contents")
}

/// Turn a `tools/call` outcome into a [`ToolResult`].
pub fn tool_result(outcome: McpResult<Value>) -> ToolResult {
    match outcome {
        Ok(result) => match serde_json::from_value::<CallToolResult>(result.clone()) {
            Ok(parsed) if parsed.is_error => {
                let text = parsed.text();
                ToolResult::failure(if text.is_empty() {
                    "tool reported an error".to_string()
                } else {
                    text
                })
            }
            _ => ToolResult::ok(result),
        },
        Err(e) => ToolResult::failure(e.to_string()),
    }
}
