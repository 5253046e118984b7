// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed task payload or checkpoint. Fatal, never retried.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Uniqueness or integrity constraint rejected the write. Replaying it fails the same way.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Integration data store error: {0}")]
    Integration(#[from] crate::port::IntegrationDataStoreError),

    /// Transient failure the worker may requeue the task for
    #[error("Retriable error: {0}")]
    Retriable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the worker should requeue the task instead of failing it
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::Retriable(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// From implementations for infra crates (to avoid circular dependency)
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Database(err)
    }
}

// Note: sqlx::Error conversion is handled in infra-sqlite crate
// by converting to AppError::Database(String)
