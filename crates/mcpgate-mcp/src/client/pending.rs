//! Correlation of in-flight requests with their responses.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{McpError, McpResult};

type Slot = oneshot::Sender<McpResult<Value>>;

/// Outstanding requests keyed by JSON-RPC id.
///
/// Responses may arrive in any order; each one resolves exactly the waiter
/// registered under its id. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<u64, Slot>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. The entry is removed when the returned
    /// handle is dropped, whether or not a response arrived.
    pub fn register(&self, id: u64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        PendingResponse {
            id,
            rx,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Deliver a response envelope. Returns false when nobody is waiting.
    pub fn complete(&self, id: u64, message: Value) -> bool {
        let slot = self.slots.lock().remove(&id);
        match slot {
            Some(tx) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    /// Fail a single waiter.
    pub fn fail(&self, id: u64, error: McpError) -> bool {
        let slot = self.slots.lock().remove(&id);
        match slot {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter with a copy of `error`. Returns how many were failed.
    pub fn fail_all(&self, error: &McpError) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.duplicate()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("outstanding", &self.len())
            .finish()
    }
}

/// Handle for one outstanding request.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<McpResult<Value>>,
    slots: Arc<Mutex<HashMap<u64, Slot>>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response envelope.
    pub async fn wait(mut self) -> McpResult<Value> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::ConnectionClosed),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.id);
    }
}
