//! Transport implementations and the factory that picks between them.
//!
//! - [`StdioClient`]: child process speaking newline-delimited JSON-RPC
//! - [`SseClient`]: GET event stream plus POSTs to an announced endpoint
//! - [`StreamableHttpClient`]: single `/mcp` endpoint with session ids

mod http;
pub mod sse;
pub mod stdio;
pub mod streamable;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mcpgate_core::{ServerSpec, TransportKind};

use crate::client::{ClientOptions, ProtocolClient};
use crate::error::McpResult;

pub use sse::SseClient;
pub use stdio::StdioClient;
pub use streamable::StreamableHttpClient;

/// Builds connected clients from specs.
///
/// The registry goes through this seam so tests can substitute their own
/// clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Construct a client for `spec` and connect it.
    async fn create(&self, spec: &ServerSpec) -> McpResult<Arc<dyn ProtocolClient>>;
}

/// The production factory: one client type per transport.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    /// Passed to every client this factory builds.
    options: ClientOptions,
}

impl TransportFactory {
    /// # Arguments
    ///
    /// * `options` - Tuning shared by all transports
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Construct a client without connecting it.
    pub fn build(&self, spec: &ServerSpec) -> McpResult<Arc<dyn ProtocolClient>> {
        spec.validate()?;
        let client: Arc<dyn ProtocolClient> = match spec.transport {
            TransportKind::Stdio => StdioClient::new(spec.clone(), self.options.clone()),
            TransportKind::Sse => SseClient::new(spec.clone(), self.options.clone())?,
            TransportKind::StreamableHttp => {
                StreamableHttpClient::new(spec.clone(), self.options.clone())?
            }
        };
        Ok(client)
    }
}

#[async_trait]
impl ClientFactory for TransportFactory {
    async fn create(&self, spec: &ServerSpec) -> McpResult<Arc<dyn ProtocolClient>> {
        let client = self.build(spec)?;
        debug!(server = %spec.id, transport = %spec.transport, "Connecting client");
        if let Err(e) = client.connect().await {
            client.close().await;
            return Err(e);
        }
        Ok(client)
    }
}
