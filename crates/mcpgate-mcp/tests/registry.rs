//! Registry tests against a scripted client factory, plus one end-to-end run
//! over the stdio transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcpgate_core::{Config, ServerSpec, TransportKind};
use mcpgate_mcp::client::session::Session;
use mcpgate_mcp::protocol::{JsonRpcNotification, JsonRpcRequest};
use mcpgate_mcp::{
    ClientFactory, ClientOptions, ClientRegistry, ConnectionState, McpError, McpResult,
    ProtocolClient, RetryPolicy, RetryTracker, ToolArguments,
};
use mcpgate_store::{MemorySpecStore, SpecStore, StoreError};
use serde_json::{json, Value};

struct FakeClient {
    spec: ServerSpec,
    session: Session,
    broken: bool,
}

#[async_trait]
impl ProtocolClient for FakeClient {
    fn session(&self) -> &Session {
        &self.session
    }

    fn transport(&self) -> TransportKind {
        self.spec.transport
    }

    async fn connect(&self) -> McpResult<()> {
        self.session.set_state(ConnectionState::Ready);
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.session.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn close(&self) {
        self.session.set_state(ConnectionState::Closed);
    }

    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<Value> {
        if self.broken {
            return Err(McpError::connection("broken pipe"));
        }
        let result = match request.method.as_str() {
            "tools/list" => json!({"tools": [{"name": format!("{}-tool", self.spec.id)}]}),
            "tools/call" => json!({"content": [{"type": "text", "text": "done"}]}),
            _ => json!({}),
        };
        Ok(json!({"jsonrpc": "2.0", "id": request.numeric_id(), "result": result}))
    }

    async fn send_notification(&self, _notification: JsonRpcNotification) -> McpResult<()> {
        Ok(())
    }
}

/// Factory that records builds and fails on demand.
#[derive(Default)]
struct FakeFactory {
    builds: Mutex<HashMap<String, usize>>,
    refuse: Mutex<HashSet<String>>,
    reject: Mutex<HashSet<String>>,
    broken: HashSet<String>,
    delay: Duration,
}

impl FakeFactory {
    fn builds(&self, id: &str) -> usize {
        self.builds.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn refuse(&self, id: &str) {
        self.refuse.lock().unwrap().insert(id.to_string());
    }

    fn accept(&self, id: &str) {
        self.refuse.lock().unwrap().remove(id);
    }

    /// Fail builds for `id` the way a malformed spec does.
    fn reject(&self, id: &str) {
        self.reject.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(&self, spec: &ServerSpec) -> McpResult<Arc<dyn ProtocolClient>> {
        *self.builds.lock().unwrap().entry(spec.id.clone()).or_default() += 1;
        tokio::time::sleep(self.delay).await;

        if self.reject.lock().unwrap().contains(&spec.id) {
            return Err(McpError::Validation(format!("{}: invalid header name", spec.id)));
        }
        if self.refuse.lock().unwrap().contains(&spec.id) {
            return Err(McpError::connection("connection refused"));
        }
        let client = Arc::new(FakeClient {
            spec: spec.clone(),
            session: Session::new(spec, &ClientOptions::default()),
            broken: self.broken.contains(&spec.id),
        });
        client.connect().await?;
        Ok(client)
    }
}

struct Harness {
    registry: ClientRegistry,
    factory: Arc<FakeFactory>,
    store: Arc<MemorySpecStore>,
}

fn harness_with(factory: FakeFactory, policy: RetryPolicy) -> Harness {
    let factory = Arc::new(factory);
    let store = Arc::new(MemorySpecStore::new());
    let registry = ClientRegistry::new(
        store.clone(),
        factory.clone(),
        Arc::new(RetryTracker::new(policy)),
    );
    Harness {
        registry,
        factory,
        store,
    }
}

fn harness() -> Harness {
    harness_with(FakeFactory::default(), fast_policy())
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        give_up_after: 5,
    }
}

fn spec(id: &str) -> ServerSpec {
    ServerSpec::stdio(id, "fake-server")
}

#[tokio::test]
async fn test_register_rejects_invalid_spec() {
    let h = harness();
    let err = h.registry.register(ServerSpec::stdio("bad", "")).await.unwrap_err();
    assert!(matches!(err, McpError::Validation(_)));
    assert!(h.store.is_empty());
    assert_eq!(h.factory.builds("bad"), 0);
}

#[tokio::test]
async fn test_register_persists_and_connects() {
    let h = harness();
    h.registry.register(spec("fs")).await.unwrap();

    assert!(h.store.get("fs").is_some());
    assert_eq!(h.registry.client_state("fs"), Some(ConnectionState::Ready));
    let client = h.registry.get_client("fs").await.unwrap();
    assert!(client.is_connected());
    assert_eq!(h.factory.builds("fs"), 1);
}

#[tokio::test]
async fn test_unknown_and_disabled_servers() {
    let h = harness();
    assert!(matches!(
        h.registry.get_client("nope").await,
        Err(McpError::ServerNotFound(_))
    ));

    h.registry.register(spec("off").with_disabled(true)).await.unwrap();
    assert!(matches!(
        h.registry.get_client("off").await,
        Err(McpError::ServerDisabled(_))
    ));
    assert_eq!(h.factory.builds("off"), 0);
}

#[tokio::test]
async fn test_concurrent_get_client_builds_once() {
    let factory = FakeFactory {
        delay: Duration::from_millis(50),
        ..FakeFactory::default()
    };
    let h = harness_with(factory, fast_policy());
    h.registry.register(spec("fs")).await.unwrap();

    // Knock the live client over so every caller wants a rebuild.
    h.registry.get_client("fs").await.unwrap().disconnect().await.unwrap();

    let results = futures::future::join_all((0..5).map(|_| h.registry.get_client("fs"))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.factory.builds("fs"), 2);
}

#[tokio::test]
async fn test_backoff_blocks_rebuilds() {
    let policy = RetryPolicy {
        base_delay: Duration::from_secs(30),
        ..fast_policy()
    };
    let h = harness_with(FakeFactory::default(), policy);
    h.factory.refuse("flaky");

    // Registration succeeds even though the connection does not.
    h.registry.register(spec("flaky")).await.unwrap();
    assert_eq!(h.registry.retry_tracker().failure_count("flaky"), 1);

    let err = h.registry.get_client("flaky").await.err().expect("expected get_client to fail");
    assert!(matches!(err, McpError::TemporarilyUnavailable { .. }));
    assert_eq!(h.factory.builds("flaky"), 1);
}

#[tokio::test]
async fn test_repeated_failures_disable_server() {
    let h = harness();
    h.factory.refuse("flaky");
    h.registry.register(spec("flaky")).await.unwrap();

    let mut last = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(15)).await;
        match h.registry.get_client("flaky").await {
            Err(McpError::ServerDisabled(_)) => {
                last = Some("disabled");
                break;
            }
            Err(_) => {}
            Ok(_) => panic!("refused server connected"),
        }
    }

    assert_eq!(last, Some("disabled"));
    assert_eq!(h.factory.builds("flaky"), 5);
    assert!(h.store.get("flaky").unwrap().disabled);
    assert!(h.registry.get_spec("flaky").unwrap().disabled);
    assert_eq!(h.registry.retry_tracker().failure_count("flaky"), 0);

    // Operators can bring it back once the server is fixed.
    h.factory.accept("flaky");
    h.registry.enable("flaky").await.unwrap();
    assert!(!h.store.get("flaky").unwrap().disabled);
    assert_eq!(h.registry.client_state("flaky"), Some(ConnectionState::Ready));
}

#[tokio::test]
async fn test_permanent_build_errors_are_returned() {
    let h = harness();
    h.factory.reject("bad");

    for _ in 0..6 {
        let err = h.registry.register(spec("bad")).await.unwrap_err();
        assert!(matches!(err, McpError::Validation(_)));
    }

    // A broken spec is an operator problem, not a flaky server.
    assert_eq!(h.factory.builds("bad"), 6);
    assert_eq!(h.registry.retry_tracker().failure_count("bad"), 0);
    assert!(!h.registry.get_spec("bad").unwrap().disabled);
    assert!(!h.store.get("bad").unwrap().disabled);
    assert!(matches!(
        h.registry.get_client("bad").await,
        Err(McpError::Validation(_))
    ));
    assert_eq!(h.registry.retry_tracker().failure_count("bad"), 0);
}

#[tokio::test]
async fn test_bad_header_never_disables_server() {
    let store = Arc::new(MemorySpecStore::new());
    let registry = ClientRegistry::from_config(&Config::default(), store.clone());
    let bad = ServerSpec::sse("bad", "http://127.0.0.1:1").with_header("bad header", "x");

    for _ in 0..5 {
        let err = registry.register(bad.clone()).await.unwrap_err();
        assert!(matches!(err, McpError::Validation(_)));
    }

    assert!(!store.get("bad").unwrap().disabled);
    assert!(matches!(
        registry.get_client("bad").await,
        Err(McpError::Validation(_))
    ));
}

#[tokio::test]
async fn test_success_resets_failures() {
    let h = harness();
    h.factory.refuse("flaky");
    h.registry.register(spec("flaky")).await.unwrap();
    assert_eq!(h.registry.retry_tracker().failure_count("flaky"), 1);

    h.factory.accept("flaky");
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.registry.get_client("flaky").await.unwrap();
    assert_eq!(h.registry.retry_tracker().failure_count("flaky"), 0);
}

#[tokio::test]
async fn test_fan_out_skips_failing_servers() {
    let factory = FakeFactory {
        broken: HashSet::from(["broken".to_string()]),
        ..FakeFactory::default()
    };
    let h = harness_with(factory, fast_policy());
    for id in ["a", "b", "broken"] {
        h.registry.register(spec(id)).await.unwrap();
    }
    h.registry.register(spec("off").with_disabled(true)).await.unwrap();

    let mut names: Vec<String> = h
        .registry
        .get_all_tools()
        .await
        .into_iter()
        .map(|t| format!("{}/{}", t.server_id, t.name))
        .collect();
    names.sort();
    assert_eq!(names, vec!["a/a-tool", "b/b-tool"]);

    // None of the fakes negotiated resources or prompts.
    assert!(h.registry.get_all_resources().await.is_empty());
    assert!(h.registry.get_all_prompts().await.is_empty());
}

#[tokio::test]
async fn test_unregister_removes_everything() {
    let h = harness();
    h.registry.register(spec("fs")).await.unwrap();
    let client = h.registry.get_client("fs").await.unwrap();

    h.registry.unregister("fs").await.unwrap();
    assert!(h.registry.get_spec("fs").is_none());
    assert!(h.store.get("fs").is_none());
    assert_eq!(client.state(), ConnectionState::Closed);

    assert!(matches!(
        h.registry.unregister("fs").await,
        Err(McpError::ServerNotFound(_))
    ));
}

/// Memory store whose deletes can be made to fail.
#[derive(Default)]
struct FailingDeleteStore {
    inner: MemorySpecStore,
    fail_deletes: AtomicBool,
}

#[async_trait]
impl SpecStore for FailingDeleteStore {
    async fn save(&self, spec: &ServerSpec) -> mcpgate_store::Result<()> {
        self.inner.save(spec).await
    }

    async fn find_all(&self) -> mcpgate_store::Result<Vec<ServerSpec>> {
        self.inner.find_all().await
    }

    async fn exists_by_id(&self, id: &str) -> mcpgate_store::Result<bool> {
        self.inner.exists_by_id(id).await
    }

    async fn delete_by_id(&self, id: &str) -> mcpgate_store::Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::PathError("disk is read-only".to_string()));
        }
        self.inner.delete_by_id(id).await
    }
}

#[tokio::test]
async fn test_unregister_store_failure_keeps_server() {
    let store = Arc::new(FailingDeleteStore::default());
    let registry = ClientRegistry::new(
        store.clone(),
        Arc::new(FakeFactory::default()),
        Arc::new(RetryTracker::new(fast_policy())),
    );
    registry.register(spec("fs")).await.unwrap();
    let client = registry.get_client("fs").await.unwrap();

    store.fail_deletes.store(true, Ordering::SeqCst);
    let err = registry.unregister("fs").await.unwrap_err();
    assert!(matches!(err, McpError::Store(_)));

    // Memory and disk still agree, and the live client keeps working.
    assert!(registry.get_spec("fs").is_some());
    assert!(store.inner.get("fs").is_some());
    assert!(client.is_connected());
    assert!(registry.get_client("fs").await.is_ok());

    store.fail_deletes.store(false, Ordering::SeqCst);
    registry.unregister("fs").await.unwrap();
    assert!(registry.get_spec("fs").is_none());
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_disable_and_enable() {
    let h = harness();
    h.registry.register(spec("fs")).await.unwrap();

    h.registry.disable("fs").await.unwrap();
    assert!(h.store.get("fs").unwrap().disabled);
    assert_eq!(h.registry.client_state("fs"), None);
    assert!(h.registry.get_all_tools().await.is_empty());

    h.registry.enable("fs").await.unwrap();
    assert_eq!(h.registry.client_state("fs"), Some(ConnectionState::Ready));
    assert_eq!(h.factory.builds("fs"), 2);
}

#[tokio::test]
async fn test_set_timeout_rebuilds_client() {
    let h = harness();
    h.registry.register(spec("fs")).await.unwrap();

    h.registry.set_timeout("fs", 90).await.unwrap();
    assert_eq!(h.store.get("fs").unwrap().timeout_secs, 90);
    assert_eq!(h.registry.client_state("fs"), None);

    let client = h.registry.get_client("fs").await.unwrap();
    assert_eq!(client.session().timeout(), Duration::from_secs(90));

    assert!(matches!(
        h.registry.set_timeout("nope", 5).await,
        Err(McpError::ServerNotFound(_))
    ));
}

#[tokio::test]
async fn test_call_tool_reports_lookup_failures() {
    let h = harness();
    let result = h.registry.call_tool("nope", "echo", &ToolArguments::new()).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("server not found"));

    h.registry.register(spec("fs")).await.unwrap();
    let result = h.registry.call_tool("fs", "anything", &ToolArguments::new()).await;
    assert_eq!(result.text().as_deref(), Some("done"));
}

#[tokio::test]
async fn test_load_prefers_stored_specs() {
    let h = harness();
    h.store_spec(spec("a").with_description("stored")).await;

    let configured = vec![
        spec("a").with_description("configured"),
        spec("b"),
        spec("c").with_disabled(true),
    ];
    let count = h.registry.load(&configured).await.unwrap();

    assert_eq!(count, 3);
    assert_eq!(
        h.registry.get_spec("a").unwrap().description.as_deref(),
        Some("stored")
    );
    assert!(h.store.get("b").is_some());
    assert_eq!(h.registry.client_state("a"), Some(ConnectionState::Ready));
    assert_eq!(h.registry.client_state("b"), Some(ConnectionState::Ready));
    assert_eq!(h.registry.client_state("c"), None);

    let ids: Vec<String> = h.registry.get_all_specs().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let h = harness();
    h.registry.register(spec("a")).await.unwrap();
    let client = h.registry.get_client("a").await.unwrap();

    h.registry.shutdown().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(h.registry.client_state("a"), None);
    assert!(h.registry.get_spec("a").is_some());
}

impl Harness {
    async fn store_spec(&self, spec: ServerSpec) {
        self.store.save(&spec).await.unwrap();
    }
}

#[tokio::test]
async fn test_stdio_servers_end_to_end() {
    let store = Arc::new(MemorySpecStore::new());
    let registry = ClientRegistry::from_config(&Config::default(), store);
    let mock = ServerSpec::stdio("mock", env!("CARGO_BIN_EXE_mock-mcp-server")).with_timeout_secs(10);
    registry.register(mock).await.unwrap();

    let tools = registry.get_all_tools().await;
    assert!(tools.iter().any(|t| t.name == "echo" && t.server_id == "mock"));
    assert_eq!(registry.get_all_resources().await.len(), 1);

    let args: ToolArguments = [
        ("a".to_string(), Some("2".to_string())),
        ("b".to_string(), Some("40".to_string())),
    ]
    .into_iter()
    .collect();
    let result = registry.call_tool("mock", "add", &args).await;
    assert_eq!(result.text().as_deref(), Some("42"));

    registry.shutdown().await;
    assert_eq!(registry.client_state("mock"), None);
}
