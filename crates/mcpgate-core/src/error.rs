//! Error types for mcpgate.
//!
//! Each crate keeps its own error enum; they all convert into [`Error`] at the
//! edges, which carries operator-facing recovery suggestions.

use thiserror::Error;

use crate::spec::SpecError;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mcpgate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server spec failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown transport kind
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/mcpgate/config.toml"),
            Error::Validation(_) => {
                Some("Stdio servers need a command; SSE and HTTP servers need a url")
            }
            Error::UnsupportedTransport(_) => {
                Some("Use one of: stdio, sse, streamable_http")
            }
            Error::Storage(_) => Some("Run 'mcpgate doctor' to check the data directory"),
            Error::Mcp(_) => Some("Use 'mcpgate server list' to check server status"),
            _ => None,
        }
    }
}

impl From<SpecError> for Error {
    fn from(e: SpecError) -> Self {
        match e {
            SpecError::UnsupportedTransport(kind) => Error::UnsupportedTransport(kind),
            other => Error::Validation(other.to_string()),
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
