//! Storage trait and errors.

use async_trait::async_trait;
use thiserror::Error;

use mcpgate_core::ServerSpec;

/// Errors that can occur during spec storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored record '{id}': {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("Storage path error: {0}")]
    PathError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for mcpgate_core::Error {
    fn from(e: StoreError) -> Self {
        mcpgate_core::Error::Storage(e.to_string())
    }
}

/// Persistence collaborator for server specs.
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Insert or replace a spec.
    async fn save(&self, spec: &ServerSpec) -> Result<()>;

    /// All stored specs, ordered by id.
    async fn find_all(&self) -> Result<Vec<ServerSpec>>;

    /// Whether a spec with this id is stored.
    async fn exists_by_id(&self, id: &str) -> Result<bool>;

    /// Delete a spec. Returns whether anything was removed.
    async fn delete_by_id(&self, id: &str) -> Result<bool>;
}
