//! # mcpgate-core
//!
//! Core types and abstractions shared by the mcpgate crates.
//!
//! This crate provides:
//! - `ServerSpec`, the registration record for one MCP server
//! - The layered configuration system
//! - Common error types

pub mod config;
pub mod error;
pub mod spec;

pub use config::Config;
pub use error::{Error, Result};
pub use spec::{ServerSpec, SpecError, TransportKind};
