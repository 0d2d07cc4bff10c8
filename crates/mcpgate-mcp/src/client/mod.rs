//! The protocol client abstraction shared by every transport.
//!
//! A transport supplies the raw send path and connection lifecycle; the MCP
//! operations (`tools/list`, `tools/call`, resources, prompts) are provided
//! once here as default methods on [`ProtocolClient`].

mod heartbeat;
pub mod pending;
pub mod session;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use mcpgate_core::{Config, TransportKind};

use crate::codec::{self, ToolArguments};
use crate::error::{McpError, McpResult};
use crate::protocol::{
    Implementation, JsonRpcNotification, JsonRpcRequest, PromptDescriptor, ResourceContents,
    ResourceDescriptor, ServerCapabilities, ServerInfo, ToolDescriptor, ToolResult,
};

pub(crate) use heartbeat::{spawn_heartbeat, Heartbeat};
pub use pending::{PendingRequests, PendingResponse};
pub use session::Session;

/// Connection state for an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport is open.
    Disconnected,
    /// The transport is being opened.
    Connecting,
    /// `initialize` is in flight.
    Handshaking,
    /// Handshake complete; requests flow normally.
    Ready,
    /// Still serving requests, but heartbeats are failing or the stream dropped.
    Degraded,
    /// Closed for good. No further transitions.
    Closed,
}

impl ConnectionState {
    /// Requests may be issued in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// A connection attempt is in progress.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Transport tuning shared by every client a factory builds.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Sent as `clientInfo` during the handshake.
    pub client_info: Implementation,
    /// Timeout for specs whose `timeout_secs` is zero.
    pub default_timeout: Duration,
    /// Interval between `tools/list` probes. Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Consecutive failed probes before a client is marked degraded.
    pub missed_heartbeats: u32,
    /// Stream reconnection attempts for the HTTP transports.
    pub reconnect_attempts: u32,
    /// Linear delay step between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Time a stdio server gets to exit after its stdin closes.
    pub stdio_grace_period: Duration,
    /// Consecutive non-JSON stdout lines tolerated before pending requests fail.
    pub max_non_json_lines: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        let transport = &config.transport;
        Self {
            client_info: Implementation {
                name: config.general.client_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            default_timeout: transport.request_timeout(),
            heartbeat_interval: transport.heartbeat_interval(),
            missed_heartbeats: transport.missed_heartbeats.max(1),
            reconnect_attempts: transport.reconnect_attempts,
            reconnect_delay: transport.reconnect_delay(),
            stdio_grace_period: transport.stdio_grace_period(),
            max_non_json_lines: transport.max_non_json_lines.max(1),
        }
    }
}

/// A live connection to one MCP server.
///
/// Implementors provide the lifecycle and the raw message path. Every MCP
/// operation is built on top of those and shared by all transports.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Bookkeeping shared with the default methods.
    fn session(&self) -> &Session;

    fn transport(&self) -> TransportKind;

    /// Open the transport and complete the handshake.
    async fn connect(&self) -> McpResult<()>;

    /// Tear down the transport. Pending requests fail with
    /// [`McpError::ConnectionClosed`]. The client may connect again later.
    async fn disconnect(&self) -> McpResult<()>;

    /// Disconnect and move to `Closed` for good. Idempotent.
    async fn close(&self);

    /// Send one request and return its raw response envelope. No readiness
    /// check and no timeout; see [`ProtocolClient::request`].
    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<Value>;

    async fn send_notification(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Called when waiting for a connection in progress timed out.
    async fn reset_connection(&self) {
        if let Err(e) = self.disconnect().await {
            debug!(server = %self.server_id(), error = %e, "Reset after ready timeout failed");
        }
    }

    fn server_id(&self) -> &str {
        self.session().server_id()
    }

    fn state(&self) -> ConnectionState {
        self.session().state()
    }

    /// True only when the handshake completed and the connection is healthy.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn server_info(&self) -> Option<ServerInfo> {
        self.session().server_info()
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        self.server_info().map(|info| info.capabilities)
    }

    /// Make sure requests can be issued, connecting or waiting as needed.
    async fn ensure_connected(&self) -> McpResult<()> {
        match self.state() {
            ConnectionState::Ready | ConnectionState::Degraded => Ok(()),
            ConnectionState::Closed => Err(McpError::ConnectionClosed),
            ConnectionState::Disconnected => self.connect().await,
            ConnectionState::Connecting | ConnectionState::Handshaking => {
                match self.session().wait_ready().await {
                    Err(e @ McpError::Timeout { .. }) => {
                        warn!(server = %self.server_id(), "Connection not ready in time, resetting");
                        self.reset_connection().await;
                        Err(e)
                    }
                    other => other,
                }
            }
        }
    }

    /// Issue a request with the client's timeout and unwrap the JSON-RPC
    /// envelope into its `result`.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<Value> {
        self.ensure_connected().await?;

        let method = request.method.clone();
        let timeout = self.session().timeout();
        let response = match tokio::time::timeout(timeout, self.send_request(request)).await {
            Ok(response) => response?,
            Err(_) => return Err(McpError::timeout(method, timeout)),
        };
        codec::parse_response(response)
    }

    async fn get_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        let id = self.session().next_id();
        let result = self.request(codec::list_tools(id)).await?;
        let tools = codec::parse_tools(self.server_id(), &result);
        debug!(server = %self.server_id(), tool_count = tools.len(), "Listed tools");
        Ok(tools)
    }

    /// Invoke a tool. Failures of any kind are reported inside the
    /// [`ToolResult`], never as an error.
    async fn call_tool(&self, name: &str, args: &ToolArguments) -> ToolResult {
        let id = self.session().next_id();
        debug!(server = %self.server_id(), tool = %name, "Calling tool");
        let outcome = self.request(codec::call_tool(id, name, args)).await;
        if let Err(e) = &outcome {
            warn!(server = %self.server_id(), tool = %name, error = %e, "Tool call failed");
        }
        codec::tool_result(outcome)
    }

    async fn get_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        self.ensure_connected().await?;
        require_capability(self, "resources", ServerCapabilities::supports_resources)?;
        let id = self.session().next_id();
        let result = self.request(codec::list_resources(id)).await?;
        Ok(codec::parse_resources(self.server_id(), &result))
    }

    async fn read_resource(&self, uri: &str) -> McpResult<Vec<ResourceContents>> {
        self.ensure_connected().await?;
        require_capability(self, "resources", ServerCapabilities::supports_resources)?;
        let id = self.session().next_id();
        let result = self.request(codec::read_resource(id, uri)).await?;
        Ok(codec::parse_resource_contents(self.server_id(), &result))
    }

    async fn get_prompts(&self) -> McpResult<Vec<PromptDescriptor>> {
        self.ensure_connected().await?;
        require_capability(self, "prompts", ServerCapabilities::supports_prompts)?;
        let id = self.session().next_id();
        let result = self.request(codec::list_prompts(id)).await?;
        Ok(codec::parse_prompts(self.server_id(), &result))
    }

    /// Render a prompt. Returns the raw `prompts/get` result.
    async fn get_prompt(&self, name: &str, args: &HashMap<String, String>) -> McpResult<Value> {
        self.ensure_connected().await?;
        require_capability(self, "prompts", ServerCapabilities::supports_prompts)?;
        let id = self.session().next_id();
        self.request(codec::get_prompt(id, name, args)).await
    }
}

fn require_capability<C>(
    client: &C,
    capability: &str,
    supported: fn(&ServerCapabilities) -> bool,
) -> McpResult<()>
where
    C: ProtocolClient + ?Sized,
{
    match client.capabilities() {
        Some(caps) if supported(&caps) => Ok(()),
        _ => Err(McpError::unsupported(client.server_id(), capability)),
    }
}
