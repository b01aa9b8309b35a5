//! Bounded worker pool for user code.
//!
//! The only place user callables run. Arguments arrive fully resolved, so
//! workers share no mutable state with the coordinator; a panic in user
//! code is observed as a task failure, never as an engine crash.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::debug;

use weir_model::Value;

use crate::error::{Result, WeirError};
use crate::registry::{OutputFn, PipeFn};

/// A fully resolved unit of user work.
pub(crate) struct TaskSpec {
    pub func: PipeFn,
    pub output_func: Option<OutputFn>,
    pub args: Vec<Value>,
}

/// What a worker observed while running a spec.
#[derive(Debug)]
pub(crate) struct TaskRun {
    pub value: Value,
    /// Declared output paths, in the order the output callable returned
    /// them; the order defines the output ordinals.
    pub output_paths: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Bounded pool of blocking workers.
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `spec` on a worker, waiting for a free slot first. The output
    /// callable (if any) runs before the main callable, with the same
    /// arguments.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskRun> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WeirError::Cancelled)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let started_at = Utc::now();
            let output_paths = match &spec.output_func {
                Some(output_func) => output_func(&spec.args)?,
                None => Vec::new(),
            };
            let value = (spec.func)(&spec.args)?;
            Ok::<_, anyhow::Error>(TaskRun {
                value,
                output_paths,
                started_at,
                finished_at: Utc::now(),
            })
        });

        match handle.await {
            Ok(Ok(run)) => Ok(run),
            Ok(Err(cause)) => {
                debug!(error = %cause, "worker reported failure");
                Err(WeirError::PipeExecution(cause))
            }
            Err(join) => Err(WeirError::PipeExecution(anyhow::anyhow!(
                "worker terminated abnormally: {join}"
            ))),
        }
    }

    /// Stop accepting work; running workers finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}
