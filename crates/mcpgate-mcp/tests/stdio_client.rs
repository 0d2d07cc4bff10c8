//! Integration tests for the stdio transport against the mock server binary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpgate_core::ServerSpec;
use mcpgate_mcp::{ClientOptions, ConnectionState, McpError, ProtocolClient, StdioClient, ToolArguments};
use serde_json::{json, Value};

fn mock_spec(args: &[&str]) -> ServerSpec {
    ServerSpec::stdio("mock", env!("CARGO_BIN_EXE_mock-mcp-server"))
        .with_args(args.iter().copied())
        .with_timeout_secs(10)
}

fn options() -> ClientOptions {
    ClientOptions {
        stdio_grace_period: Duration::from_millis(500),
        ..ClientOptions::default()
    }
}

async fn connected(args: &[&str]) -> Arc<StdioClient> {
    let client = StdioClient::new(mock_spec(args), options());
    client.connect().await.expect("connect to mock server");
    client
}

fn args(pairs: &[(&str, &str)]) -> ToolArguments {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect()
}

#[tokio::test]
async fn test_connect_skips_banner_and_handshakes() {
    let client = connected(&["--banner", "3"]).await;

    assert!(client.is_connected());
    assert_eq!(client.state(), ConnectionState::Ready);
    let info = client.server_info().expect("server info after handshake");
    assert_eq!(info.implementation.name, "mock-mcp-server");
    assert_eq!(info.protocol_version, "2024-11-05");
    assert!(client.pid().await.is_some());

    client.close().await;
}

#[tokio::test]
async fn test_list_tools_skips_malformed_entries() {
    let client = connected(&[]).await;

    let tools = client.get_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "add", "slow", "fail"]);
    assert!(tools.iter().all(|t| t.server_id == "mock"));

    client.close().await;
}

#[tokio::test]
async fn test_call_tool_coerces_arguments() {
    let client = connected(&[]).await;

    let result = client
        .call_tool("echo", &args(&[("n", "3"), ("f", "1.5"), ("b", "true"), ("s", "hello")]))
        .await;
    assert!(result.success, "{:?}", result.error);

    let echoed: Value = serde_json::from_str(&result.text().unwrap()).unwrap();
    assert_eq!(echoed, json!({"n": 3, "f": 1.5, "b": true, "s": "hello"}));

    let sum = client.call_tool("add", &args(&[("a", "2"), ("b", "40")])).await;
    assert_eq!(sum.text().as_deref(), Some("42"));

    client.close().await;
}

#[tokio::test]
async fn test_tool_errors_become_failed_results() {
    let client = connected(&[]).await;

    let result = client.call_tool("fail", &ToolArguments::new()).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("tool exploded"));

    let result = client.call_tool("nope", &ToolArguments::new()).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("-32602"));

    client.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_routed_by_id() {
    let client = connected(&[]).await;

    let slow_args = args(&[("ms", "400")]);
    let fast_args = args(&[("ms", "20")]);
    let (slow, fast) = tokio::join!(
        client.call_tool("slow", &slow_args),
        client.call_tool("slow", &fast_args)
    );

    assert_eq!(slow.text().as_deref(), Some("slept 400"));
    assert_eq!(fast.text().as_deref(), Some("slept 20"));

    client.close().await;
}

#[tokio::test]
async fn test_resources_and_prompts() {
    let client = connected(&[]).await;

    let resources = client.get_resources().await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "file:///readme.md");
    assert_eq!(resources[0].server_id, "mock");

    let contents = client.read_resource("file:///readme.md").await.unwrap();
    assert_eq!(contents[0].text.as_deref(), Some("# Mock"));

    let prompts = client.get_prompts().await.unwrap();
    assert_eq!(prompts[0].name, "greet");
    assert!(prompts[0].arguments[0].required);

    let mut prompt_args = HashMap::new();
    prompt_args.insert("who".to_string(), "Ada".to_string());
    let rendered = client.get_prompt("greet", &prompt_args).await.unwrap();
    assert_eq!(rendered["messages"][0]["content"]["text"], "Hello, Ada!");

    client.close().await;
}

#[tokio::test]
async fn test_missing_capability_is_unsupported() {
    let client = connected(&["--no-resources"]).await;

    let err = client.get_resources().await.unwrap_err();
    assert!(matches!(err, McpError::Unsupported { ref capability, .. } if capability == "resources"));
    assert!(matches!(client.get_prompts().await, Err(McpError::Unsupported { .. })));

    client.close().await;
}

#[tokio::test]
async fn test_request_times_out() {
    let spec = mock_spec(&["--ignore", "slow"]).with_timeout_secs(1);
    let client = StdioClient::new(spec, options());
    client.connect().await.unwrap();

    let result = client.call_tool("slow", &ToolArguments::new()).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("timed out"));
    // The connection itself is still fine.
    assert!(client.is_connected());

    client.close().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests() {
    let client = connected(&["--ignore", "slow"]).await;

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call_tool("slow", &ToolArguments::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.disconnect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("pending call released")
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("connection closed"));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.pid().await.is_none());
}

#[tokio::test]
async fn test_process_exit_then_reconnect() {
    let client = connected(&["--crash-on", "fail"]).await;

    let result = client.call_tool("fail", &ToolArguments::new()).await;
    assert!(!result.success);

    // The reader notices EOF and marks the client disconnected.
    for _ in 0..50 {
        if client.state() == ConnectionState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // The next call spawns a fresh process.
    let result = client.call_tool("add", &args(&[("a", "1"), ("b", "1")])).await;
    assert_eq!(result.text().as_deref(), Some("2"));
    assert!(client.is_connected());

    client.close().await;
}

#[tokio::test]
async fn test_non_json_flood_fails_pending_call() {
    let options = ClientOptions {
        max_non_json_lines: 5,
        ..options()
    };
    let client = StdioClient::new(mock_spec(&["--noise-on", "echo:5"]), options);
    client.connect().await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.call_tool("echo", &ToolArguments::new()),
    )
    .await
    .expect("call released by noise limit");
    assert!(!result.success);
    assert!(result.error.unwrap().contains("non-JSON"));

    client.close().await;
}

#[tokio::test]
async fn test_close_is_terminal() {
    let client = connected(&[]).await;
    client.close().await;
    client.close().await;

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.get_tools().await, Err(McpError::ConnectionClosed)));
    assert!(matches!(client.connect().await, Err(McpError::ConnectionClosed)));
}

#[tokio::test]
async fn test_spawn_failure_leaves_client_disconnected() {
    let spec = ServerSpec::stdio("ghost", "/nonexistent/mcpgate-mock");
    let client = StdioClient::new(spec, options());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, McpError::Transport(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
