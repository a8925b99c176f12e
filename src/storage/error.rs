//! Storage error types
//!
//! Defines all errors that can occur in the storage layer. Callers are
//! expected to tell three families apart:
//!
//! - `Validation`: the request itself is malformed and nothing was applied
//! - `NotFound`: an addressed entity (alarm, resource) does not exist
//! - `NotSupported`: the backend lacks a capability; degrade, don't reject

use thiserror::Error;

/// Errors that can occur in a storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    /// Malformed filter, pagination or entity
    #[error("Validation error: {0}")]
    Validation(String),

    /// Addressed entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend does not implement this capability
    #[error("Not supported by this backend: {0}")]
    NotSupported(String),

    /// Underlying database failed
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StorageError::Validation(msg.into())
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        StorageError::NotSupported(what.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, StorageError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, StorageError::NotSupported(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
