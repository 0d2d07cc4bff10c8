//! Server registration records.
//!
//! A [`ServerSpec`] describes how to reach one MCP server. It is created by
//! configuration import or through the registry API and is only mutated to
//! flip the `disabled` flag or change the timeout.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request timeout used when a spec does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Errors raised while validating or parsing a server spec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    /// The spec has no identifier.
    #[error("server id cannot be empty")]
    MissingId,

    /// A field required by the transport is empty.
    #[error("server '{id}': {field} is required for {transport} transport")]
    MissingField {
        id: String,
        field: &'static str,
        transport: TransportKind,
    },

    /// The transport kind is not one we can speak.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
}

/// The transport used to reach an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON over stdin/stdout.
    Stdio,
    /// SSE stream plus a POST message endpoint.
    Sse,
    /// Single HTTP endpoint with an optional SSE upgrade.
    StreamableHttp,
}

impl TransportKind {
    /// Canonical upper-case name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "STDIO",
            Self::Sse => "SSE",
            Self::StreamableHttp => "STREAMABLE_HTTP",
        }
    }

    /// Whether the transport is reached over HTTP.
    pub fn is_http(&self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamable_http" | "streamable-http" | "streamablehttp" | "http" => {
                Ok(Self::StreamableHttp)
            }
            _ => Err(SpecError::UnsupportedTransport(s.to_string())),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportKind> for String {
    fn from(kind: TransportKind) -> Self {
        kind.as_str().to_string()
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique server identifier.
    pub id: String,
    /// Display name. Falls back to the id when empty.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Transport used to reach the server.
    pub transport: TransportKind,
    /// Command to execute (stdio).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments (stdio).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables for the child process (stdio).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Working directory for the child process (stdio).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Base URL (SSE and streamable HTTP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra headers sent with every HTTP request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Round-trip timeout for a single request, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Disabled servers are never connected.
    #[serde(default)]
    pub disabled: bool,
}

impl ServerSpec {
    fn new(id: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: None,
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            disabled: false,
        }
    }

    /// Create a spec for a server spawned as a child process.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>) -> Self {
        let mut spec = Self::new(id, TransportKind::Stdio);
        spec.command = Some(command.into());
        spec
    }

    /// Create a spec for an SSE server.
    pub fn sse(id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut spec = Self::new(id, TransportKind::Sse);
        spec.url = Some(url.into());
        spec
    }

    /// Create a spec for a streamable HTTP server.
    pub fn streamable_http(id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut spec = Self::new(id, TransportKind::StreamableHttp);
        spec.url = Some(url.into());
        spec
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the command arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an HTTP header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the request timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the disabled flag.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Name to show to humans.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Check that the fields required by the transport are present.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.trim().is_empty() {
            return Err(SpecError::MissingId);
        }

        let (field, value) = match self.transport {
            TransportKind::Stdio => ("command", self.command.as_deref()),
            TransportKind::Sse | TransportKind::StreamableHttp => ("url", self.url.as_deref()),
        };

        if value.map_or(true, |v| v.trim().is_empty()) {
            return Err(SpecError::MissingField {
                id: self.id.clone(),
                field,
                transport: self.transport,
            });
        }

        Ok(())
    }
}
