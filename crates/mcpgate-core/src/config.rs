//! Configuration system for mcpgate.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::spec::ServerSpec;

/// Main configuration struct for mcpgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Transport timing
    pub transport: TransportConfig,
    /// Reconnection backoff
    pub retry: RetryConfig,
    /// Where server specs are persisted
    pub storage: StorageConfig,
    /// Servers imported into the registry at startup
    pub servers: Vec<ServerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Client name sent in the initialize handshake
    pub client_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            client_name: "mcpgate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default round-trip timeout for specs that leave it unset
    pub request_timeout_secs: u64,
    /// Interval between heartbeat probes
    pub heartbeat_interval_secs: u64,
    /// Consecutive failed heartbeats before a client is degraded
    pub missed_heartbeats: u32,
    /// SSE reconnection attempts after the stream drops
    pub reconnect_attempts: u32,
    /// Linear reconnection delay step
    pub reconnect_delay_ms: u64,
    /// How long a stdio server gets to exit after stdin closes
    pub stdio_grace_period_ms: u64,
    /// Consecutive non-JSON stdout lines tolerated from a stdio server
    pub max_non_json_lines: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            heartbeat_interval_secs: 60,
            missed_heartbeats: 3,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
            stdio_grace_period_ms: 2000,
            max_non_json_lines: 100,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stdio_grace_period(&self) -> Duration {
        Duration::from_millis(self.stdio_grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff after the first failure
    pub base_delay_ms: u64,
    /// Backoff ceiling
    pub max_delay_secs: u64,
    /// Consecutive failures before a server is disabled
    pub give_up_after: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_secs: 60,
            give_up_after: 5,
        }
    }
}

/// Persistence backend for server specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite database file
    #[default]
    Sqlite,
    /// Process-local map; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,
    /// Database path; defaults to the platform data directory
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the database path.
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("servers.db"))
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "transport.missed_heartbeats")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

/// Wrapper used when reading a standalone server list.
#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ServerSpec>,
}

impl Config {
    fn figment(extra: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            // Default values
            .merge(Serialized::defaults(Config::default()))
            // User config
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            // Project config
            .merge(Toml::file(".mcpgate/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".mcpgate/config.local.toml"));

        if let Some(path) = extra {
            figment = figment.merge(Toml::file(path));
        }

        // Environment variables, e.g. MCPGATE_TRANSPORT__HEARTBEAT_INTERVAL_SECS
        figment.merge(Env::prefixed("MCPGATE_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(None).extract()
    }

    /// Load configuration, layering an explicit file over the defaults.
    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Self::figment(Some(path)).extract()
    }

    /// Load and validate configuration.
    pub fn load_validated(path: Option<&Path>) -> Result<Self, Error> {
        let config = Self::figment(path)
            .extract::<Self>()
            .map_err(|e| Error::Config(e.to_string()))?;
        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(config)
    }

    /// Read `[[servers]]` tables from a standalone TOML file.
    pub fn import_servers(path: &Path) -> Result<Vec<ServerSpec>, Error> {
        let text = std::fs::read_to_string(path)?;
        let list: ServerList = toml::from_str(&text).map_err(|e| {
            let message = e.to_string();
            if message.contains("unsupported transport") {
                Error::UnsupportedTransport(message)
            } else {
                Error::Config(format!("{}: {}", path.display(), message))
            }
        })?;

        for spec in &list.servers {
            spec.validate()?;
        }

        Ok(list.servers)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.general.client_name.trim().is_empty() {
            result.add_error("general.client_name", "client_name cannot be empty");
        }

        let transport = &self.transport;
        if transport.request_timeout_secs == 0 {
            result.add_error(
                "transport.request_timeout_secs",
                "request_timeout_secs must be greater than 0",
            );
        } else if transport.request_timeout_secs < 5 {
            result.add_warning(
                "transport.request_timeout_secs",
                "request_timeout_secs is very low (< 5s), slow servers will time out",
            );
        }

        if transport.heartbeat_interval_secs == 0 {
            result.add_error(
                "transport.heartbeat_interval_secs",
                "heartbeat_interval_secs must be greater than 0",
            );
        }

        if transport.missed_heartbeats == 0 {
            result.add_error(
                "transport.missed_heartbeats",
                "missed_heartbeats must be greater than 0",
            );
        }

        if transport.reconnect_attempts == 0 {
            result.add_warning(
                "transport.reconnect_attempts",
                "reconnect_attempts is 0, dropped SSE streams will not be re-established",
            );
        }

        if transport.max_non_json_lines == 0 {
            result.add_error(
                "transport.max_non_json_lines",
                "max_non_json_lines must be greater than 0",
            );
        }

        if self.retry.give_up_after == 0 {
            result.add_error("retry.give_up_after", "give_up_after must be greater than 0");
        }

        if self.retry.max_delay_secs.saturating_mul(1000) < self.retry.base_delay_ms {
            result.add_error(
                "retry.max_delay_secs",
                "max_delay_secs cannot be smaller than base_delay_ms",
            );
        }

        let mut seen = HashSet::new();
        for (index, spec) in self.servers.iter().enumerate() {
            let field = format!("servers[{}]", index);
            if let Err(e) = spec.validate() {
                result.add_error(field.clone(), e.to_string());
            }
            if !seen.insert(spec.id.as_str()) {
                result.add_error(field, format!("duplicate server id '{}'", spec.id));
            }
        }

        result
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("mcpgate"))
            .unwrap_or_else(|| PathBuf::from("~/.config/mcpgate"))
    }

    /// Get the data directory (for the spec database).
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join("mcpgate"))
            .unwrap_or_else(|| PathBuf::from("~/.local/share/mcpgate"))
    }
}
