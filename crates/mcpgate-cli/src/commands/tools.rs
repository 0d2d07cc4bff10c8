//! Tool, resource and prompt commands.

use mcpgate_mcp::{ProtocolClient, ToolArguments};

use crate::AppContext;

pub async fn list_tools(ctx: &AppContext, server: Option<&str>) -> anyhow::Result<()> {
    ctx.load().await?;
    let tools = match server {
        Some(id) => ctx.registry.get_client(id).await?.get_tools().await?,
        None => ctx.registry.get_all_tools().await,
    };

    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }
    for tool in tools {
        match &tool.description {
            Some(description) => println!("{}/{} - {}", tool.server_id, tool.name, description),
            None => println!("{}/{}", tool.server_id, tool.name),
        }
    }
    Ok(())
}

pub async fn list_resources(ctx: &AppContext) -> anyhow::Result<()> {
    ctx.load().await?;
    let resources = ctx.registry.get_all_resources().await;
    if resources.is_empty() {
        println!("No resources available.");
        return Ok(());
    }
    for resource in resources {
        println!("{}: {} ({})", resource.server_id, resource.uri, resource.name);
    }
    Ok(())
}

pub async fn list_prompts(ctx: &AppContext) -> anyhow::Result<()> {
    ctx.load().await?;
    let prompts = ctx.registry.get_all_prompts().await;
    if prompts.is_empty() {
        println!("No prompts available.");
        return Ok(());
    }
    for prompt in prompts {
        let args: Vec<String> = prompt
            .arguments
            .iter()
            .map(|arg| {
                if arg.required {
                    arg.name.clone()
                } else {
                    format!("[{}]", arg.name)
                }
            })
            .collect();
        println!("{}/{} {}", prompt.server_id, prompt.name, args.join(" "));
    }
    Ok(())
}

pub async fn call(ctx: &AppContext, server: &str, tool: &str, raw_args: &[String]) -> anyhow::Result<()> {
    let args = parse_tool_args(raw_args);
    ctx.load().await?;

    let result = ctx.registry.call_tool(server, tool, &args).await;
    if !result.success {
        anyhow::bail!(
            "{}/{} failed: {}",
            server,
            tool,
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    match result.text() {
        Some(text) => println!("{}", text),
        None => println!("{}", serde_json::to_string_pretty(&result.result)?),
    }
    Ok(())
}

/// `key=value` becomes a string to be coerced; a bare `key` is sent as null.
fn parse_tool_args(raw: &[String]) -> ToolArguments {
    raw.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        })
        .collect()
}
