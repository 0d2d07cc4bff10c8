//! # mcpgate-store
//!
//! Persistence for server specs.
//!
//! The registry never touches storage directly; it talks to a [`SpecStore`]
//! with four operations (`save`, `find_all`, `exists_by_id`, `delete_by_id`).
//! Two backends are provided:
//! - [`SqliteSpecStore`] - a single SQLite file, the default
//! - [`MemorySpecStore`] - a process-local map, used by tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mcpgate_core::ServerSpec;
//! use mcpgate_store::{SpecStore, SqliteSpecStore};
//!
//! let store = SqliteSpecStore::open_default()?;
//! store.save(&ServerSpec::stdio("fs", "mcp-server-filesystem")).await?;
//! assert!(store.exists_by_id("fs").await?);
//! ```

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemorySpecStore;
pub use sqlite::SqliteSpecStore;
pub use store::{Result, SpecStore, StoreError};
