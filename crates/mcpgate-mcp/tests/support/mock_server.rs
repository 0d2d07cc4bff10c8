//! Mock MCP server for the stdio integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and answers initialize,
//! tools/list, tools/call, resources/* and prompts/*.
//!
//! Usage:
//!   mock-mcp-server [--banner N] [--no-resources] [--crash-on TOOL]
//!                   [--ignore TOOL] [--noise-on TOOL:N]
//!
//! Options:
//!   --banner N        Print N non-JSON lines on stdout before serving
//!   --no-resources    Do not advertise resources or prompts
//!   --crash-on TOOL   Exit with code 1 when TOOL is called
//!   --ignore TOOL     Never answer calls to TOOL
//!   --noise-on T:N    Answer calls to T with N lines of non-JSON output

#![allow(dead_code)]

use std::env;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

struct ServerConfig {
    banner: usize,
    resources: bool,
    crash_on: Option<String>,
    ignore: Option<String>,
    noise_on: Option<(String, usize)>,
}

impl ServerConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self {
            banner: 0,
            resources: true,
            crash_on: None,
            ignore: None,
            noise_on: None,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--banner" => {
                    config.banner = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                    i += 2;
                }
                "--no-resources" => {
                    config.resources = false;
                    i += 1;
                }
                "--crash-on" => {
                    config.crash_on = value;
                    i += 2;
                }
                "--ignore" => {
                    config.ignore = value;
                    i += 2;
                }
                "--noise-on" => {
                    config.noise_on = value.and_then(|v| {
                        let (tool, n) = v.split_once(':')?;
                        Some((tool.to_string(), n.parse().ok()?))
                    });
                    i += 2;
                }
                _ => i += 1,
            }
        }

        config
    }
}

type Output = Arc<Mutex<std::io::Stdout>>;

fn write_line(out: &Output, line: &str) {
    let mut stdout = out.lock().unwrap();
    writeln!(stdout, "{}", line).unwrap();
    stdout.flush().unwrap();
}

fn respond(out: &Output, id: &Value, result: Result<Value, (i64, &str)>) {
    let message = match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }),
    };
    write_line(out, &message.to_string());
}

fn main() {
    let config = ServerConfig::from_args();
    let out: Output = Arc::new(Mutex::new(std::io::stdout()));

    eprintln!("mock-mcp-server starting");
    for n in 0..config.banner {
        write_line(&out, &format!("mock-mcp-server banner line {}", n));
    }

    let stdin = std::io::stdin();
    let reader = BufReader::new(stdin.lock());

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications carry no id and get no answer.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" => {
                let mut capabilities = json!({"tools": {}});
                if config.resources {
                    capabilities["resources"] = json!({});
                    capabilities["prompts"] = json!({});
                }
                respond(
                    &out,
                    &id,
                    Ok(json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": capabilities,
                        "serverInfo": {"name": "mock-mcp-server", "version": "1.0.0"}
                    })),
                );
            }
            "tools/list" => respond(&out, &id, Ok(tool_list())),
            "tools/call" => call_tool(&config, &out, id, &params),
            "resources/list" => respond(
                &out,
                &id,
                Ok(json!({
                    "resources": [
                        {"uri": "file:///readme.md", "name": "readme", "mimeType": "text/markdown"}
                    ]
                })),
            ),
            "resources/read" => respond(
                &out,
                &id,
                Ok(json!({
                    "contents": [
                        {"uri": params["uri"], "mimeType": "text/markdown", "text": "# Mock"}
                    ]
                })),
            ),
            "prompts/list" => respond(
                &out,
                &id,
                Ok(json!({
                    "prompts": [{
                        "name": "greet",
                        "description": "Say hello",
                        "arguments": [{"name": "who", "required": true}]
                    }]
                })),
            ),
            "prompts/get" => {
                let who = params["arguments"]["who"].as_str().unwrap_or("nobody");
                respond(
                    &out,
                    &id,
                    Ok(json!({
                        "messages": [{
                            "role": "user",
                            "content": {"type": "text", "text": format!("Hello, {}!", who)}
                        }]
                    })),
                );
            }
            _ => respond(&out, &id, Err((-32601, "Method not found"))),
        }
    }
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echo back the arguments as JSON",
                "inputSchema": {"type": "object", "properties": {}}
            },
            {
                "name": "add",
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"]
                }
            },
            {
                "name": "slow",
                "description": "Answer after `ms` milliseconds",
                "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}}}
            },
            {
                "name": "fail",
                "description": "Always reports an error"
            },
            {
                "description": "entry without a name"
            }
        ]
    })
}

fn call_tool(config: &ServerConfig, out: &Output, id: Value, params: &Value) {
    let name = params["name"].as_str().unwrap_or_default().to_string();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if config.crash_on.as_deref() == Some(name.as_str()) {
        std::process::exit(1);
    }
    if config.ignore.as_deref() == Some(name.as_str()) {
        return;
    }
    if let Some((tool, lines)) = &config.noise_on {
        if *tool == name {
            for n in 0..*lines {
                write_line(out, &format!("log: working on it ({})", n));
            }
            return;
        }
    }

    let text = |t: String| json!({"content": [{"type": "text", "text": t}]});

    match name.as_str() {
        "echo" => respond(out, &id, Ok(text(args.to_string()))),
        "add" => {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            respond(out, &id, Ok(text(sum.to_string())));
        }
        "slow" => {
            let ms = args["ms"].as_u64().unwrap_or(100);
            let out = Arc::clone(out);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(ms));
                respond(&out, &id, Ok(json!({"content": [{"type": "text", "text": format!("slept {}", ms)}]})));
            });
        }
        "fail" => respond(
            out,
            &id,
            Ok(json!({"content": [{"type": "text", "text": "tool exploded"}], "isError": true})),
        ),
        _ => respond(out, &id, Err((-32602, "Unknown tool"))),
    }
}
