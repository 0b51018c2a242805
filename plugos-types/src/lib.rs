//! Core type definitions for plugos.
//!
//! This crate defines the plugin-agnostic types shared by the storage layer,
//! the plugin host and its tooling:
//! - Sandbox identifiers (UUID v7) and per-sandbox call correlation tokens
//! - Key/value records as persisted by the document store
//! - The query specification wire shape accepted by `store.query`
//! - Plugin definitions: a name plus opaque per-function code
//!
//! Values are kept as `serde_json::Value` everywhere so that the host never
//! needs to know the shape of a plugin's documents.

mod ids;
mod manifest;
mod query;
mod record;

pub use ids::{CallId, SandboxId};
pub use manifest::{FunctionDefinition, PluginDefinition};
pub use query::{Filter, FilterOp, QuerySpec};
pub use record::KvPair;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid filter operator: {0}")]
    InvalidOperator(String),
}
