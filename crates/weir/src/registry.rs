//! Pipe registration and live callable bindings.
//!
//! The database stores only pipe metadata (and source text for anonymous
//! callables); the closures themselves live here, bound per process. A
//! pipe persisted by an earlier session must be re-registered before it
//! can run again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use weir_model::{entity::normalize_source, Pipe, PipeId, PipeIdentity, Signature, Value};
use weir_store::Store;

use crate::error::{Result, WeirError};

/// The callable a pipe executes. Receives the resolved arguments in bound
/// order (file resources as their absolute path string, resources as
/// their payload) and returns the produced value.
pub type PipeFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Sibling callable mapping the same arguments to the list of file paths
/// the pipe will produce; the order defines the output ordinals.
pub type OutputFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Vec<PathBuf>> + Send + Sync>;

/// Everything needed to register a pipe.
pub struct PipeSpec {
    identity: PipeIdentity,
    func: PipeFn,
    output_func: Option<OutputFn>,
    source: Option<String>,
    output_source: Option<String>,
    signature: Signature,
    return_volatile: bool,
    is_deterministic: bool,
    description: Option<String>,
}

impl PipeSpec {
    /// A pipe importable under a stable module path.
    pub fn named<F>(module: impl Into<String>, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::build(PipeIdentity::named(module, name), Arc::new(func), None)
    }

    /// An anonymous callable, identified by a hash of its source text.
    /// The text is persisted so the definition can be recovered later.
    pub fn from_source<F>(source: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let source = source.into();
        let identity = PipeIdentity::from_source(&source);
        Self::build(identity, Arc::new(func), Some(normalize_source(&source)))
    }

    fn build(identity: PipeIdentity, func: PipeFn, source: Option<String>) -> Self {
        Self {
            identity,
            func,
            output_func: None,
            source,
            output_source: None,
            // Without a declared schema, every positional argument is
            // accepted as-is.
            signature: Signature::new(Vec::new()).variadic(),
            return_volatile: false,
            is_deterministic: true,
            description: None,
        }
    }

    /// Declare the parameter schema used for argument normalization.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Attach the output-path callable, optionally with its source text.
    pub fn with_output_func<F>(mut self, output_func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Vec<PathBuf>> + Send + Sync + 'static,
    {
        self.output_func = Some(Arc::new(output_func));
        self
    }

    pub fn with_output_source(mut self, source: impl Into<String>) -> Self {
        self.output_source = Some(normalize_source(&source.into()));
        self
    }

    /// The returned payload is one-shot (generator-style) and is never
    /// written to the vault.
    pub fn volatile_return(mut self) -> Self {
        self.return_volatile = true;
        self
    }

    /// Disable dedup: every call produces a fresh task.
    pub fn non_deterministic(mut self) -> Self {
        self.is_deterministic = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

struct Binding {
    func: PipeFn,
    output_func: Option<OutputFn>,
}

/// Process-local registry of pipe callables.
pub(crate) struct PipeRegistry {
    bindings: RwLock<HashMap<PipeId, Binding>>,
}

impl PipeRegistry {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Register a pipe, deduping by identity.
    ///
    /// Re-registering an identical definition returns the existing pipe
    /// and rebinds the live callables; the same identity with different
    /// attributes is a conflict.
    pub fn register(&self, store: &Store, spec: PipeSpec) -> Result<Pipe> {
        if let Some(existing) = store.get_pipe_by_identity(&spec.identity)? {
            let compatible = existing.return_volatile == spec.return_volatile
                && existing.is_deterministic == spec.is_deterministic
                && existing.has_output_func == spec.output_func.is_some()
                && existing.signature == spec.signature;
            if !compatible {
                return Err(WeirError::PipeRegistrationConflict {
                    identity: spec.identity.canonical(),
                });
            }
            debug!(pipe_id = %existing.id, identity = %existing.identity, "pipe rebound");
            self.bind(&existing.id, spec.func, spec.output_func);
            return Ok(existing);
        }

        let pipe = Pipe {
            id: PipeId::new(),
            identity: spec.identity,
            signature: spec.signature,
            return_volatile: spec.return_volatile,
            is_deterministic: spec.is_deterministic,
            has_output_func: spec.output_func.is_some(),
            description: spec.description,
            created_at: Utc::now(),
        };
        store.insert_pipe(&pipe, spec.source.as_deref(), spec.output_source.as_deref())?;
        self.bind(&pipe.id, spec.func, spec.output_func);
        Ok(pipe)
    }

    fn bind(&self, id: &PipeId, func: PipeFn, output_func: Option<OutputFn>) {
        self.bindings
            .write()
            .insert(id.clone(), Binding { func, output_func });
    }

    /// The live callables for a pipe; fails if the pipe was never bound
    /// in this process.
    pub fn callables(&self, id: &PipeId) -> Result<(PipeFn, Option<OutputFn>)> {
        self.bindings
            .read()
            .get(id)
            .map(|b| (b.func.clone(), b.output_func.clone()))
            .ok_or_else(|| WeirError::UnknownPipe(id.to_string()))
    }
}
