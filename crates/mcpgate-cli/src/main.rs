//! # mcpgate-cli
//!
//! Command-line interface for mcpgate.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcpgate_core::config::StorageBackend;
use mcpgate_core::error::format_error_with_suggestion;
use mcpgate_core::{Config, TransportKind};
use mcpgate_mcp::{ClientRegistry, McpError};
use mcpgate_store::{MemorySpecStore, SpecStore, SqliteSpecStore};

mod commands;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn SpecStore>,
    pub registry: ClientRegistry,
}

impl AppContext {
    fn new(config: Config) -> anyhow::Result<Self> {
        let store = open_store(&config)?;
        let registry = ClientRegistry::from_config(&config, Arc::clone(&store));
        Ok(Self {
            config,
            store,
            registry,
        })
    }

    /// Load persisted and configured servers into the registry, connecting
    /// the enabled ones.
    pub async fn load(&self) -> anyhow::Result<usize> {
        Ok(self.registry.load(&self.config.servers).await?)
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SpecStore>> {
    let store: Arc<dyn SpecStore> = match config.storage.backend {
        StorageBackend::Sqlite => {
            let path = config.storage.database_path();
            let store = SqliteSpecStore::new(&path)
                .with_context(|| format!("opening spec database {}", path.display()))?;
            Arc::new(store)
        }
        StorageBackend::Memory => Arc::new(MemorySpecStore::new()),
    };
    Ok(store)
}

/// mcpgate - connect to and manage MCP servers
#[derive(Parser)]
#[command(name = "mcpgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Extra config file layered over the defaults
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Server registration and status
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// List tools across servers
    Tools {
        /// Only list tools from this server
        #[arg(short, long)]
        server: Option<String>,
    },
    /// List resources across servers
    Resources,
    /// List prompts across servers
    Prompts,
    /// Call a tool
    Call {
        /// Server id
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments; values are coerced to numbers and booleans
        #[arg(value_name = "KEY=VALUE")]
        args: Vec<String>,
    },
    /// Diagnose configuration, storage and server connectivity
    Doctor,
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ServerAction {
    /// List registered servers
    List,
    /// Show one server's spec and status
    Show {
        /// Server id
        id: String,
    },
    /// Register a server
    Add(AddArgs),
    /// Remove a server
    Remove {
        /// Server id
        id: String,
    },
    /// Enable a server
    Enable {
        /// Server id
        id: String,
    },
    /// Disable a server
    Disable {
        /// Server id
        id: String,
    },
    /// Register every `[[servers]]` entry in a TOML file
    Import {
        /// TOML file
        path: PathBuf,
    },
}

#[derive(Args)]
struct AddArgs {
    /// Server id
    id: String,

    /// Transport (stdio, sse, streamable_http)
    #[arg(short, long, default_value = "stdio")]
    transport: TransportKind,

    /// Command to spawn (stdio)
    #[arg(long)]
    command: Option<String>,

    /// Command argument, repeatable (stdio)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Environment variable, repeatable (stdio)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = commands::parse_key_value)]
    env: Vec<(String, String)>,

    /// Base URL (sse, streamable_http)
    #[arg(long)]
    url: Option<String>,

    /// Extra HTTP header, repeatable (sse, streamable_http)
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = commands::parse_key_value)]
    headers: Vec<(String, String)>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Description
    #[arg(long)]
    description: Option<String>,

    /// Register without connecting
    #[arg(long)]
    disabled: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("mcpgate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load_validated(cli.config.as_deref())?;
    let ctx = AppContext::new(config)?;

    let result = match cli.command {
        Commands::Server { action } => commands::server::handle(action, &ctx).await,
        Commands::Tools { server } => commands::tools::list_tools(&ctx, server.as_deref()).await,
        Commands::Resources => commands::tools::list_resources(&ctx).await,
        Commands::Prompts => commands::tools::list_prompts(&ctx).await,
        Commands::Call { server, tool, args } => {
            commands::tools::call(&ctx, &server, &tool, &args).await
        }
        Commands::Doctor => commands::doctor::run(&ctx).await,
        Commands::Version => Ok(()),
    };

    // Stdio servers are child processes; never leave them behind.
    ctx.registry.shutdown().await;
    result
}

/// Print an error, with a recovery hint when one applies.
fn report(error: anyhow::Error) {
    let error = match error.downcast::<McpError>() {
        Ok(mcp) => anyhow::Error::new(mcpgate_core::Error::from(mcp)),
        Err(other) => other,
    };
    match error.downcast_ref::<mcpgate_core::Error>() {
        Some(core) => eprintln!("Error: {}", format_error_with_suggestion(core)),
        None => eprintln!("Error: {:#}", error),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        report(e);
        std::process::exit(1);
    }
}
