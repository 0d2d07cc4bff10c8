//! Per-client bookkeeping shared by every transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use mcpgate_core::ServerSpec;

use super::{ClientOptions, ConnectionState, ProtocolClient};
use crate::codec;
use crate::error::{McpError, McpResult};
use crate::protocol::{Implementation, ServerInfo};

/// Connection state, negotiated server info and the request id counter for
/// one client.
///
/// State changes are published on a watch channel so callers can block until
/// a connection in progress settles.
pub struct Session {
    /// Id of the server this session talks to.
    server_id: String,
    /// Per-request timeout.
    timeout: Duration,
    /// Sent as `clientInfo` in `initialize`.
    client_info: Implementation,
    /// Current state; receivers come from [`Session::subscribe`].
    state: watch::Sender<ConnectionState>,
    /// What the server reported during the handshake.
    server_info: RwLock<Option<ServerInfo>>,
    /// Next JSON-RPC request id.
    next_id: AtomicU64,
    /// Most recent connection failure, for operators.
    last_error: Mutex<Option<String>>,
}

impl Session {
    /// Start a session in the `Disconnected` state.
    ///
    /// # Arguments
    ///
    /// * `spec` - Supplies the server id and timeout; a zero timeout falls back to the default
    /// * `options` - Supplies the default timeout and client info
    pub fn new(spec: &ServerSpec, options: &ClientOptions) -> Self {
        let timeout = if spec.timeout_secs == 0 {
            options.default_timeout
        } else {
            spec.timeout()
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            server_id: spec.id.clone(),
            timeout,
            client_info: options.client_info.clone(),
            state,
            server_info: RwLock::new(None),
            next_id: AtomicU64::new(1),
            last_error: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Round-trip timeout for every request on this client.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` and return the previous state. `Closed` is terminal:
    /// once reached, further transitions are ignored.
    pub fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut previous = next;
        self.state.send_if_modified(|current| {
            previous = *current;
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            *current = next;
            true
        });
        if previous != next && previous != ConnectionState::Closed {
            debug!(server = %self.server_id, from = %previous, to = %next, "Connection state changed");
        }
        previous
    }

    /// Move to `to` only if the current state is `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current != from || from == to {
                return false;
            }
            *current = to;
            true
        });
        if changed {
            debug!(server = %self.server_id, from = %from, to = %to, "Connection state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Block while the client is connecting or handshaking.
    ///
    /// Resolves once the state settles. A client that ends up `Disconnected`
    /// yields the recorded connection error.
    pub async fn wait_ready(&self) -> McpResult<()> {
        let mut rx = self.state.subscribe();
        let settled = match tokio::time::timeout(
            self.timeout,
            rx.wait_for(|state| !state.is_transitional()),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(McpError::ConnectionClosed),
            Err(_) => return Err(McpError::timeout("waiting for connection", self.timeout)),
        };

        match settled {
            ConnectionState::Ready | ConnectionState::Degraded => Ok(()),
            ConnectionState::Closed => Err(McpError::ConnectionClosed),
            _ => Err(McpError::connection(
                self.last_error()
                    .unwrap_or_else(|| "connection attempt failed".to_string()),
            )),
        }
    }

    /// Next request id. Ids start at 1 and are never reused by this client.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    pub fn record_error(&self, error: impl ToString) {
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Run `initialize` followed by `notifications/initialized` over `client`
    /// and move to `Ready`.
    ///
    /// Uses the client's raw send path, so it must only be called once the
    /// transport can carry messages.
    pub async fn handshake<C>(&self, client: &C) -> McpResult<ServerInfo>
    where
        C: ProtocolClient + ?Sized,
    {
        self.set_state(ConnectionState::Handshaking);
        debug!(server = %self.server_id, "Initializing MCP connection");

        let request = codec::initialize(self.next_id(), &self.client_info);
        let response = match tokio::time::timeout(self.timeout, client.send_request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(McpError::handshake(e.to_string())),
            Err(_) => return Err(McpError::timeout("initialize", self.timeout)),
        };
        let result = codec::parse_response(response).map_err(|e| McpError::handshake(e.to_string()))?;
        let info = codec::parse_initialize(result)?;

        client
            .send_notification(codec::initialized())
            .await
            .map_err(|e| McpError::handshake(e.to_string()))?;

        *self.server_info.write() = Some(info.clone());
        *self.last_error.lock() = None;

        if !self.transition(ConnectionState::Handshaking, ConnectionState::Ready) {
            return Err(McpError::handshake(format!(
                "connection changed to {} during handshake",
                self.state()
            )));
        }

        info!(
            server = %self.server_id,
            server_name = %info.implementation.name,
            protocol_version = %info.protocol_version,
            "MCP connection initialized"
        );
        Ok(info)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}
