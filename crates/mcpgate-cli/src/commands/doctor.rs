//! Diagnostic command to check configuration, storage and servers.

use mcpgate_core::config::StorageBackend;
use mcpgate_core::Config;
use mcpgate_mcp::ProtocolClient;

use crate::AppContext;

pub async fn run(ctx: &AppContext) -> anyhow::Result<()> {
    println!("Running diagnostics...\n");

    // Check config directory
    let config_dir = Config::config_dir();
    println!("Config directory: {:?}", config_dir);
    if config_dir.join("config.toml").exists() {
        println!("  ✓ config.toml found");
    } else {
        println!("  ✗ No config.toml (using defaults)");
    }

    // Check storage
    println!("\nStorage:");
    match ctx.config.storage.backend {
        StorageBackend::Sqlite => {
            let path = ctx.config.storage.database_path();
            println!("  SQLite database: {:?}", path);
            match ctx.store.find_all().await {
                Ok(specs) => println!("  ✓ Readable ({} stored servers)", specs.len()),
                Err(e) => println!("  ✗ Failed to read: {}", e),
            }
        }
        StorageBackend::Memory => println!("  In-memory (nothing is persisted)"),
    }

    // Check servers
    println!("\nServers:");
    ctx.load().await?;
    let specs = ctx.registry.get_all_specs();
    if specs.is_empty() {
        println!("  ✗ No servers registered");
    }

    for spec in specs {
        if spec.disabled {
            println!("  - {} (disabled)", spec.id);
            continue;
        }
        match ctx.registry.get_client(&spec.id).await {
            Ok(client) => {
                let server = client
                    .server_info()
                    .map(|info| format!("{} {}", info.implementation.name, info.implementation.version))
                    .unwrap_or_else(|| "unknown server".to_string());
                match client.get_tools().await {
                    Ok(tools) => println!(
                        "  ✓ {} [{}] {} - {} tools",
                        spec.id,
                        spec.transport,
                        server,
                        tools.len()
                    ),
                    Err(e) => println!("  ✗ {} [{}] connected but listing tools failed: {}", spec.id, spec.transport, e),
                }
            }
            Err(e) => {
                println!("  ✗ {} [{}] {}", spec.id, spec.transport, e);
                let failures = ctx.registry.retry_tracker().failure_count(&spec.id);
                if failures > 0 {
                    println!("    {} consecutive connection failures", failures);
                }
            }
        }
    }

    println!("\nDiagnostics complete.");
    Ok(())
}
