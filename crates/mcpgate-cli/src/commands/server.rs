//! Server registration commands.

use mcpgate_core::{Config, ServerSpec, TransportKind};
use mcpgate_mcp::{ConnectionState, McpError, ProtocolClient};

use crate::{AddArgs, AppContext, ServerAction};

pub async fn handle(action: ServerAction, ctx: &AppContext) -> anyhow::Result<()> {
    match action {
        ServerAction::List => list(ctx).await,
        ServerAction::Show { id } => show(ctx, &id).await,
        ServerAction::Add(args) => {
            ctx.load().await?;
            let spec = args.into_spec();
            let id = spec.id.clone();
            ctx.registry.register(spec).await?;
            println!("Registered server '{}' ({})", id, status(ctx, &id));
            Ok(())
        }
        ServerAction::Remove { id } => {
            ctx.load().await?;
            ctx.registry.unregister(&id).await?;
            println!("Removed server '{}'", id);
            Ok(())
        }
        ServerAction::Enable { id } => {
            ctx.load().await?;
            ctx.registry.enable(&id).await?;
            println!("Enabled server '{}' ({})", id, status(ctx, &id));
            Ok(())
        }
        ServerAction::Disable { id } => {
            ctx.load().await?;
            ctx.registry.disable(&id).await?;
            println!("Disabled server '{}'", id);
            Ok(())
        }
        ServerAction::Import { path } => {
            let specs = Config::import_servers(&path)?;
            ctx.load().await?;
            for spec in specs {
                let id = spec.id.clone();
                ctx.registry.register(spec).await?;
                println!("  ✓ {} ({})", id, status(ctx, &id));
            }
            Ok(())
        }
    }
}

async fn list(ctx: &AppContext) -> anyhow::Result<()> {
    ctx.load().await?;
    let specs = ctx.registry.get_all_specs();
    if specs.is_empty() {
        println!("No MCP servers registered.");
        return Ok(());
    }

    println!("{:<20} {:<16} {:<14} TARGET", "ID", "TRANSPORT", "STATUS");
    for spec in specs {
        let target = match spec.transport {
            TransportKind::Stdio => {
                let mut line = spec.command.clone().unwrap_or_default();
                for arg in &spec.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            }
            _ => spec.url.clone().unwrap_or_default(),
        };
        println!(
            "{:<20} {:<16} {:<14} {}",
            spec.id,
            spec.transport.as_str(),
            status(ctx, &spec.id),
            target
        );
    }
    Ok(())
}

async fn show(ctx: &AppContext, id: &str) -> anyhow::Result<()> {
    ctx.load().await?;
    let spec = ctx
        .registry
        .get_spec(id)
        .ok_or_else(|| McpError::ServerNotFound(id.to_string()))?;

    println!("{}", serde_json::to_string_pretty(&spec)?);
    println!("\nStatus: {}", status(ctx, id));

    if let Ok(client) = ctx.registry.get_client(id).await {
        if let Some(info) = client.server_info() {
            println!(
                "Server: {} {} (protocol {})",
                info.implementation.name, info.implementation.version, info.protocol_version
            );
        }
        if let Some(error) = client.session().last_error() {
            println!("Last error: {}", error);
        }
    }
    if let Some(failure) = ctx.registry.retry_tracker().failure_info(id) {
        println!("Recent failures: {}", failure.failure_count);
    }
    Ok(())
}

/// One-word status for a registered server.
fn status(ctx: &AppContext, id: &str) -> String {
    let disabled = ctx.registry.get_spec(id).map_or(false, |spec| spec.disabled);
    if disabled {
        return "disabled".to_string();
    }
    match ctx.registry.client_state(id) {
        Some(state) => state.to_string(),
        None => ConnectionState::Disconnected.to_string(),
    }
}

impl AddArgs {
    /// Build the spec described by the flags. Validation happens on register.
    fn into_spec(self) -> ServerSpec {
        let mut spec = match self.transport {
            TransportKind::Stdio => {
                ServerSpec::stdio(self.id, self.command.unwrap_or_default()).with_args(self.args)
            }
            TransportKind::Sse => ServerSpec::sse(self.id, self.url.unwrap_or_default()),
            TransportKind::StreamableHttp => {
                ServerSpec::streamable_http(self.id, self.url.unwrap_or_default())
            }
        };

        for (key, value) in self.env {
            spec = spec.with_env(key, value);
        }
        for (name, value) in self.headers {
            spec = spec.with_header(name, value);
        }
        if let Some(secs) = self.timeout {
            spec = spec.with_timeout_secs(secs);
        }
        if let Some(name) = self.name {
            spec = spec.with_name(name);
        }
        if let Some(description) = self.description {
            spec = spec.with_description(description);
        }
        spec.with_disabled(self.disabled)
    }
}
