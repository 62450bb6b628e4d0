//! Metadata Error Types
//!
//! All store operations return `Result<T>`, aliased to `Result<T, MetadataError>`,
//! so database and serialization failures propagate with `?`.
//!
//! ## Error Categories
//!
//! - `Database`: SQLite operation failed (connection, query, transaction)
//! - `Migration`: embedded schema migration could not be applied
//! - `Serialization`: agent payload could not be encoded or decoded
//! - `NotFound`: a record addressed by id no longer exists
//! - `Closed`: the store or provider was closed
//! - `InvalidData`: a persisted column holds a value outside its domain

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Agent not found: {0}")]
    NotFound(i64),

    #[error("Store closed")]
    Closed,

    #[error("Invalid data in column {column}: {value}")]
    InvalidData { column: &'static str, value: String },
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::Migration(e.to_string())
    }
}
