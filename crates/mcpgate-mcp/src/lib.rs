//! # mcpgate-mcp
//!
//! MCP (Model Context Protocol) client layer for mcpgate.
//!
//! This crate provides:
//! - JSON-RPC message construction and parsing for the MCP methods
//! - stdio, SSE and streamable HTTP transports behind one `ProtocolClient` trait
//! - Per-server retry tracking with exponential backoff
//! - `ClientRegistry`, which owns server specs and their live clients

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod transport;

pub use client::{ClientOptions, ConnectionState, ProtocolClient};
pub use codec::{ToolArgument, ToolArguments};
pub use error::{McpError, McpResult, TransportError};
pub use protocol::{
    PromptDescriptor, ResourceContents, ResourceDescriptor, ServerInfo, ToolDescriptor, ToolResult,
};
pub use registry::ClientRegistry;
pub use retry::{RetryPolicy, RetryTracker};
pub use transport::{ClientFactory, SseClient, StdioClient, StreamableHttpClient, TransportFactory};
