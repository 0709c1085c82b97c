//! Error types for the pipeline orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Claim/admission errors.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("File {file_id} not found")]
    FileNotFound { file_id: i64 },

    #[error("File {file_id} already has an active task")]
    AlreadyActive { file_id: i64 },

    #[error("File {file_id} retry budget exhausted after {retry_count} retries")]
    RetriesExhausted { file_id: i64, retry_count: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Recovery engine errors.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Task {id} not stale yet (last update {since:?} ago)")]
    NotStale { id: Uuid, since: Duration },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
