//! MCP-specific error types.

use std::time::Duration;

use thiserror::Error;

use mcpgate_core::SpecError;

/// Errors that can occur on the stdio transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The transport could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection was closed while a request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// `initialize` failed or returned malformed capabilities.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A request or the connection-ready wait exceeded the timeout.
    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    /// The spec declares a transport we cannot speak.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// No spec is registered under this id.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// The spec is missing a field its transport needs.
    #[error("invalid server spec: {0}")]
    Validation(String),

    /// The server is disabled and will not be connected.
    #[error("server disabled: {0}")]
    ServerDisabled(String),

    /// The server is in backoff after recent failures.
    #[error("server temporarily unavailable: {server} (retry in {}s)", .retry_in.as_secs())]
    TemporarilyUnavailable { server: String, retry_in: Duration },

    /// The server did not negotiate the capability needed for this call.
    #[error("{capability} not supported by server {server}")]
    Unsupported { server: String, capability: String },

    /// Protocol-level error (malformed messages, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server returned an error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i64, message: String },

    /// Stdio transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Spec persistence failed.
    #[error("storage error: {0}")]
    Store(#[from] mcpgate_store::StoreError),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a server error from a JSON-RPC error.
    pub fn server_error(code: i64, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Create an unsupported-capability error.
    pub fn unsupported(server: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::Unsupported {
            server: server.into(),
            capability: capability.into(),
        }
    }

    /// Errors caused by the caller or configuration rather than flaky
    /// infrastructure. These are surfaced immediately and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ServerNotFound(_)
                | Self::UnsupportedTransport(_)
                | Self::Validation(_)
                | Self::ServerDisabled(_)
        )
    }

    /// A lightweight copy for fanning one failure out to many waiters.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Connection(m) => Self::Connection(m.clone()),
            Self::Handshake(m) => Self::Handshake(m.clone()),
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::Timeout { operation, after } => Self::timeout(operation.clone(), *after),
            Self::ServerError { code, message } => Self::server_error(*code, message.clone()),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<SpecError> for McpError {
    fn from(e: SpecError) -> Self {
        match e {
            SpecError::UnsupportedTransport(kind) => Self::UnsupportedTransport(kind),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<McpError> for mcpgate_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Validation(m) => mcpgate_core::Error::Validation(m),
            McpError::UnsupportedTransport(k) => mcpgate_core::Error::UnsupportedTransport(k),
            McpError::Store(s) => s.into(),
            other => mcpgate_core::Error::Mcp(other.to_string()),
        }
    }
}

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;
