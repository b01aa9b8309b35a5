//! Error types for the store crate.

use thiserror::Error;

/// Errors that can occur in the store crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection or statement failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Vault or database file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or row (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A vault entry referenced by a resource is gone.
    #[error("vault payload missing: {0}")]
    PayloadMissing(String),

    /// Deleting would break edges to entities outside the deleted set.
    #[error("dependents outside the deleted set: {0}")]
    DependentsExist(String),

    /// A database file that should not exist already does.
    #[error("database already exists at {0}")]
    AlreadyExists(String),

    /// Stored data violates an engine invariant.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The operation is not expressible over the stored graph.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
