//! Error types for the engine crate.

use std::path::PathBuf;

use thiserror::Error;

use weir_model::{FileId, ModelError, ResourceId};
use weir_store::StoreError;

/// Errors surfaced by the weir engine.
#[derive(Debug, Error)]
pub enum WeirError {
    /// The pipe is not bound to a callable in this process.
    #[error("unknown pipe: {0}")]
    UnknownPipe(String),

    /// The identity is already registered with incompatible attributes.
    #[error("pipe `{identity}` is already registered with different attributes")]
    PipeRegistrationConflict { identity: String },

    /// An input file resource was overwritten or no longer matches its
    /// registration.
    #[error("stale file resource {id}: {reason}")]
    StaleFileResource { id: FileId, reason: String },

    /// No file resource is registered at the path.
    #[error("no file resource registered at {}", .0.display())]
    UnknownFile(PathBuf),

    /// The resource's vault payload is gone and cannot be reloaded.
    #[error("missing payload for resource {0}")]
    MissingResource(ResourceId),

    /// A volatile resource was read a second time.
    #[error("volatile resource {0} has already been consumed")]
    VolatileAlreadyConsumed(ResourceId),

    /// User code failed; the underlying cause is attached.
    #[error("pipe execution failed: {0}")]
    PipeExecution(#[source] anyhow::Error),

    /// Argument binding or value validation failed.
    #[error(transparent)]
    Schema(#[from] ModelError),

    /// The store aborted the operation; the database stays consistent.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The batch dataflow graph is not acyclic.
    #[error("batch dependency graph contains a cycle")]
    CycleDetected,

    /// No further work is accepted (the pool has shut down).
    #[error("execution was cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, WeirError>;
