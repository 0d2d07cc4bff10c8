//! Client registry.
//!
//! Owns the server specs and the live clients built from them. Callers ask for
//! a client by server id; the registry hands back a cached connected client or,
//! subject to the retry tracker's backoff, builds a fresh one. Servers that keep
//! failing are disabled and the flip is persisted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use mcpgate_core::{Config, ServerSpec};
use mcpgate_store::SpecStore;

use crate::client::{ClientOptions, ConnectionState, ProtocolClient};
use crate::codec::ToolArguments;
use crate::error::{McpError, McpResult};
use crate::protocol::{PromptDescriptor, ResourceDescriptor, ToolDescriptor, ToolResult};
use crate::retry::{RetryPolicy, RetryTracker};
use crate::transport::{ClientFactory, TransportFactory};

type SharedClient = Arc<dyn ProtocolClient>;

/// Registry of MCP servers and their live clients.
pub struct ClientRegistry {
    specs: RwLock<HashMap<String, ServerSpec>>,
    clients: RwLock<HashMap<String, SharedClient>>,
    /// One build at a time per server id.
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    retry: Arc<RetryTracker>,
    store: Arc<dyn SpecStore>,
    factory: Arc<dyn ClientFactory>,
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn SpecStore>,
        factory: Arc<dyn ClientFactory>,
        retry: Arc<RetryTracker>,
    ) -> Self {
        Self {
            specs: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
            retry,
            store,
            factory,
        }
    }

    /// Registry wired with the transport factory and backoff from `config`.
    pub fn from_config(config: &Config, store: Arc<dyn SpecStore>) -> Self {
        let factory = TransportFactory::new(ClientOptions::from(config));
        let retry = RetryTracker::new(RetryPolicy::from(&config.retry));
        Self::new(store, Arc::new(factory), Arc::new(retry))
    }

    pub fn retry_tracker(&self) -> &Arc<RetryTracker> {
        &self.retry
    }

    /// Load persisted specs, add configured specs the store does not know yet,
    /// and connect every enabled server. Connection failures are logged.
    ///
    /// Returns the number of specs now registered.
    pub async fn load(&self, configured: &[ServerSpec]) -> McpResult<usize> {
        let stored = self.store.find_all().await?;
        let mut specs: HashMap<String, ServerSpec> = stored
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();

        for spec in configured {
            if specs.contains_key(&spec.id) {
                debug!(server = %spec.id, "Stored spec takes precedence over configured one");
                continue;
            }
            spec.validate()?;
            self.store.save(spec).await?;
            specs.insert(spec.id.clone(), spec.clone());
        }

        let count = specs.len();
        let enabled: Vec<String> = specs
            .values()
            .filter(|spec| !spec.disabled)
            .map(|spec| spec.id.clone())
            .collect();
        self.specs.write().extend(specs);

        info!(count, enabled = enabled.len(), "Loaded MCP server specs");

        let results = join_all(enabled.iter().map(|id| self.get_client(id))).await;
        let mut connected = 0;
        for (id, result) in enabled.iter().zip(results) {
            match result {
                Ok(_) => connected += 1,
                Err(e) => warn!(server = %id, error = %e, "Failed to connect server at startup"),
            }
        }
        info!(connected, failed = enabled.len() - connected, "MCP servers started");

        Ok(count)
    }

    /// Register or replace a server.
    ///
    /// The spec is persisted before anything else. Unless disabled, a new
    /// client is built, replacing any previous one. A transient build failure
    /// does not fail the registration; it is recorded for backoff and may
    /// disable the server. A permanent one (a malformed header, an unusable
    /// URL) is returned and leaves the retry state alone.
    pub async fn register(&self, spec: ServerSpec) -> McpResult<()> {
        spec.validate()?;
        self.store.save(&spec).await?;
        self.specs.write().insert(spec.id.clone(), spec.clone());

        let lock = self.build_lock(&spec.id);
        let _building = lock.lock().await;

        let previous = self.clients.write().remove(&spec.id);
        if let Some(previous) = previous {
            debug!(server = %spec.id, "Closing previous client");
            previous.close().await;
        }

        if spec.disabled {
            info!(server = %spec.id, "Registered disabled server");
            return Ok(());
        }

        match self.factory.create(&spec).await {
            Ok(client) => {
                self.retry.record_success(&spec.id);
                self.clients.write().insert(spec.id.clone(), client);
                info!(server = %spec.id, transport = %spec.transport, "Registered server");
            }
            Err(e) if e.is_permanent() => {
                warn!(server = %spec.id, error = %e, "Registered server cannot be built");
                return Err(e);
            }
            Err(e) => {
                warn!(server = %spec.id, error = %e, "Registered server but could not connect");
                self.record_build_failure(&spec.id, &e).await;
            }
        }
        Ok(())
    }

    /// Remove a server, its persisted spec and its live client.
    pub async fn unregister(&self, server_id: &str) -> McpResult<()> {
        let deleted = self.store.delete_by_id(server_id).await?;
        let known = self.specs.write().remove(server_id).is_some();
        if !known && !deleted {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        }

        let lock = self.build_lock(server_id);
        let _building = lock.lock().await;

        let client = self.clients.write().remove(server_id);
        if let Some(client) = client {
            client.close().await;
        }
        self.retry.clear(server_id);
        self.build_locks.lock().remove(server_id);

        info!(server = %server_id, "Unregistered server");
        Ok(())
    }

    /// Get a usable client for a server, building one if needed.
    pub async fn get_client(&self, server_id: &str) -> McpResult<SharedClient> {
        self.enabled_spec(server_id)?;
        if let Some(client) = self.connected_client(server_id) {
            return Ok(client);
        }

        let lock = self.build_lock(server_id);
        let _building = lock.lock().await;

        // Another caller may have finished a build while we waited.
        let spec = self.enabled_spec(server_id)?;
        let existing = self.clients.read().get(server_id).cloned();
        if let Some(client) = &existing {
            if client.is_connected() {
                return Ok(Arc::clone(client));
            }
        }

        if !self.retry.can_retry(server_id) {
            return match existing {
                Some(client) => {
                    debug!(server = %server_id, state = %client.state(), "In backoff, returning last known client");
                    Ok(client)
                }
                None => Err(McpError::TemporarilyUnavailable {
                    server: server_id.to_string(),
                    retry_in: self.retry.retry_in(server_id).unwrap_or_default(),
                }),
            };
        }

        if let Some(stale) = existing {
            self.clients.write().remove(server_id);
            debug!(server = %server_id, state = %stale.state(), "Replacing stale client");
            stale.close().await;
        }

        match self.factory.create(&spec).await {
            Ok(client) => {
                self.retry.record_success(server_id);
                self.clients
                    .write()
                    .insert(server_id.to_string(), Arc::clone(&client));
                info!(server = %server_id, "Connected client");
                Ok(client)
            }
            Err(e) => {
                if !e.is_permanent() {
                    self.record_build_failure(server_id, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Tools from every connected, enabled server. Servers that fail are
    /// skipped.
    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        self.fan_out("tools", |client| async move { client.get_tools().await })
            .await
    }

    pub async fn get_all_resources(&self) -> Vec<ResourceDescriptor> {
        self.fan_out("resources", |client| async move { client.get_resources().await })
            .await
    }

    pub async fn get_all_prompts(&self) -> Vec<PromptDescriptor> {
        self.fan_out("prompts", |client| async move { client.get_prompts().await })
            .await
    }

    /// Every registered spec, ordered by id.
    pub fn get_all_specs(&self) -> Vec<ServerSpec> {
        let mut specs: Vec<ServerSpec> = self.specs.read().values().cloned().collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    pub fn get_spec(&self, server_id: &str) -> Option<ServerSpec> {
        self.specs.read().get(server_id).cloned()
    }

    /// State of the live client for a server, if one exists.
    pub fn client_state(&self, server_id: &str) -> Option<ConnectionState> {
        self.clients.read().get(server_id).map(|client| client.state())
    }

    /// Re-enable a server and try to connect it.
    pub async fn enable(&self, server_id: &str) -> McpResult<()> {
        let spec = self.update_spec(server_id, |spec| spec.disabled = false)?;
        self.store.save(&spec).await?;
        self.retry.clear(server_id);
        info!(server = %server_id, "Enabled server");

        if let Err(e) = self.get_client(server_id).await {
            warn!(server = %server_id, error = %e, "Enabled server but could not connect");
        }
        Ok(())
    }

    /// Disable a server and close its client.
    pub async fn disable(&self, server_id: &str) -> McpResult<()> {
        let spec = self.update_spec(server_id, |spec| spec.disabled = true)?;
        self.store.save(&spec).await?;
        self.retry.clear(server_id);
        self.drop_client(server_id).await;
        info!(server = %server_id, "Disabled server");
        Ok(())
    }

    /// Change a server's request timeout. The next `get_client` builds a
    /// client with the new value.
    pub async fn set_timeout(&self, server_id: &str, timeout_secs: u64) -> McpResult<()> {
        let spec = self.update_spec(server_id, |spec| spec.timeout_secs = timeout_secs)?;
        self.store.save(&spec).await?;
        self.drop_client(server_id).await;
        info!(server = %server_id, timeout_secs, "Updated server timeout");
        Ok(())
    }

    /// Call a tool on a server. Lookup and connection failures are reported
    /// in the result like any other tool failure.
    pub async fn call_tool(&self, server_id: &str, name: &str, args: &ToolArguments) -> ToolResult {
        match self.get_client(server_id).await {
            Ok(client) => client.call_tool(name, args).await,
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    /// Close every live client. Specs stay registered.
    pub async fn shutdown(&self) {
        let clients: Vec<(String, SharedClient)> = self.clients.write().drain().collect();
        info!(count = clients.len(), "Shutting down MCP clients");
        join_all(clients.iter().map(|(_, client)| client.close())).await;
    }

    fn build_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.build_locks.lock();
        Arc::clone(locks.entry(server_id.to_string()).or_default())
    }

    fn enabled_spec(&self, server_id: &str) -> McpResult<ServerSpec> {
        let spec = self
            .get_spec(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        if spec.disabled {
            return Err(McpError::ServerDisabled(server_id.to_string()));
        }
        Ok(spec)
    }

    fn connected_client(&self, server_id: &str) -> Option<SharedClient> {
        self.clients
            .read()
            .get(server_id)
            .filter(|client| client.is_connected())
            .cloned()
    }

    fn update_spec(&self, server_id: &str, change: impl FnOnce(&mut ServerSpec)) -> McpResult<ServerSpec> {
        let mut specs = self.specs.write();
        let spec = specs
            .get_mut(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        change(spec);
        Ok(spec.clone())
    }

    async fn drop_client(&self, server_id: &str) {
        let client = self.clients.write().remove(server_id);
        if let Some(client) = client {
            client.close().await;
        }
    }

    async fn record_build_failure(&self, server_id: &str, error: &McpError) {
        let info = self.retry.record_failure(server_id);
        debug!(server = %server_id, failures = info.failure_count, error = %error, "Client build failed");
        if info.gave_up {
            self.auto_disable(server_id, info.failure_count).await;
        }
    }

    /// Flip the spec to disabled and persist it directly, without going back
    /// through `register`.
    async fn auto_disable(&self, server_id: &str, failures: u32) {
        let spec = match self.update_spec(server_id, |spec| spec.disabled = true) {
            Ok(spec) => spec,
            Err(_) => return,
        };
        if let Err(e) = self.store.save(&spec).await {
            error!(server = %server_id, error = %e, "Failed to persist auto-disabled spec");
        }
        self.retry.clear(server_id);
        self.drop_client(server_id).await;
        warn!(server = %server_id, failures, "Auto-disabled server after repeated connection failures");
    }

    async fn fan_out<T, F, Fut>(&self, what: &str, fetch: F) -> Vec<T>
    where
        F: Fn(SharedClient) -> Fut,
        Fut: Future<Output = McpResult<Vec<T>>>,
    {
        let clients: Vec<(String, SharedClient)> = {
            let specs = self.specs.read();
            self.clients
                .read()
                .iter()
                .filter(|(id, client)| {
                    client.is_connected() && specs.get(*id).map_or(false, |spec| !spec.disabled)
                })
                .map(|(id, client)| (id.clone(), Arc::clone(client)))
                .collect()
        };

        let results = join_all(clients.iter().map(|(_, client)| fetch(Arc::clone(client)))).await;

        let mut items = Vec::new();
        for ((server_id, _), result) in clients.iter().zip(results) {
            match result {
                Ok(found) => items.extend(found),
                Err(e @ McpError::Unsupported { .. }) => {
                    debug!(server = %server_id, error = %e, "Skipping server for {}", what)
                }
                Err(e) => warn!(server = %server_id, error = %e, "Failed to list {}, skipping server", what),
            }
        }
        items
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("specs", &self.specs.read().len())
            .field("clients", &self.clients.read().len())
            .finish()
    }
}
