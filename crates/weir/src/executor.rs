//! Task execution: dedup lookup, argument resolution, commit.
//!
//! `run_bound` is the single path through which pipes execute, both for
//! direct calls and for batch scheduling. Per fingerprint, at most one
//! execution is in flight engine-wide; a concurrent call with the same
//! fingerprint waits, then observes the committed task through the dedup
//! lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use weir_model::{
    fingerprint, flag, Argument, BoundArgs, FileId, FileResource, FingerprintAtom, ModelError,
    NodeRef, OutputRef, Pipe, Resource, ResourceId, Task, TaskId, Value,
};
use weir_store::{Store, StoreError, Vault};

use crate::error::{Result, WeirError};
use crate::files::{self, FileTracker, Integrity};
use crate::pool::{TaskSpec, WorkerPool};
use crate::registry::PipeRegistry;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Shared engine state: the store, the vault, the live pipe bindings, the
/// worker pool, and the process-local one-shot payloads of volatile
/// resources.
pub(crate) struct Executor {
    pub store: Arc<Store>,
    pub vault: Vault,
    pub registry: PipeRegistry,
    pub pool: WorkerPool,
    pub files: FileTracker,
    volatile: Mutex<HashMap<ResourceId, Value>>,
    in_flight: Mutex<HashMap<String, Gate>>,
}

impl Executor {
    pub fn new(store: Store, vault: Vault, workers: usize) -> Self {
        let store = Arc::new(store);
        Self {
            vault,
            registry: PipeRegistry::new(),
            pool: WorkerPool::new(workers),
            files: FileTracker::new(store.clone()),
            store,
            volatile: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The payload of a resource. Non-volatile payloads reload from the
    /// vault on every read; volatile payloads are consumed by the first
    /// read.
    pub fn resource_content(&self, id: &ResourceId) -> Result<Value> {
        let resource = self.store.get_resource(id)?;
        if resource.volatile {
            return self
                .volatile
                .lock()
                .remove(id)
                .ok_or_else(|| WeirError::VolatileAlreadyConsumed(id.clone()));
        }
        let hash = resource
            .vault_hash
            .ok_or_else(|| WeirError::MissingResource(id.clone()))?;
        self.vault.get(&hash).map_err(|e| match e {
            StoreError::PayloadMissing(_) => WeirError::MissingResource(id.clone()),
            other => other.into(),
        })
    }

    /// Resolve one bound argument into the plain value handed to user
    /// code: resources materialize to their payload, file resources to
    /// their absolute path (after a freshness gate).
    fn resolve_argument(&self, arg: &Argument) -> Result<Value> {
        match arg {
            Argument::Value(value) => Ok(value.clone()),
            Argument::Resource(id) => self.resource_content(id),
            Argument::File(id) => {
                let file = self.store.get_file(id)?;
                self.files.require_fresh(&file)?;
                Ok(Value::Str(file.path.display().to_string()))
            }
            Argument::Virtual(id) => Err(ModelError::UnresolvedVirtual(id.clone()).into()),
        }
    }

    /// The canonical fingerprint of invoking `pipe` with `bound`.
    pub fn fingerprint_of(&self, pipe: &Pipe, bound: &BoundArgs) -> Result<String> {
        let mut atoms = Vec::with_capacity(bound.values.len());
        for arg in &bound.values {
            atoms.push(match arg {
                Argument::Value(value) => FingerprintAtom::Value(value.clone()),
                Argument::Resource(id) => {
                    let resource = self.store.get_resource(id)?;
                    let producer = self.store.get_task(&resource.task_id)?;
                    FingerprintAtom::TaskOutput {
                        fingerprint: producer.fingerprint,
                        ordinal: resource.ordinal,
                    }
                }
                Argument::File(id) => FingerprintAtom::FileDigest(self.store.get_file(id)?.md5),
                Argument::Virtual(id) => {
                    return Err(ModelError::UnresolvedVirtual(id.clone()).into());
                }
            });
        }
        Ok(fingerprint(&pipe.identity, &atoms))
    }

    /// Whether every output of a prior task can still be served: files
    /// present, current, and size-consistent; payloads still in the vault
    /// (or, for volatile resources, still unconsumed).
    fn outputs_valid(&self, task: &Task) -> Result<bool> {
        for output in &task.outputs {
            match output {
                OutputRef::Resource(id) => {
                    let resource = self.store.get_resource(id)?;
                    let valid = match &resource.vault_hash {
                        Some(hash) => self.vault.contains(hash),
                        None => self.volatile.lock().contains_key(id),
                    };
                    if !valid {
                        return Ok(false);
                    }
                }
                OutputRef::File(id) => {
                    if self
                        .store
                        .has_flag(&NodeRef::File(id.clone()), flag::OVERWRITTEN)?
                    {
                        return Ok(false);
                    }
                    let file = self.store.get_file(id)?;
                    if self.files.integrity(&file, false)? != Integrity::Ok {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Execute `pipe` with normalized arguments, or return the prior task
    /// with the same fingerprint.
    pub async fn run_bound(&self, pipe: &Pipe, bound: BoundArgs) -> Result<Task> {
        let fp = self.fingerprint_of(pipe, &bound)?;
        let gate = self.gate(&fp);
        let result = {
            let _held = gate.lock().await;
            self.run_gated(pipe, bound, &fp).await
        };
        self.release_gate(&fp, gate);
        result
    }

    async fn run_gated(&self, pipe: &Pipe, bound: BoundArgs, fp: &str) -> Result<Task> {
        // Stale inputs fail before anything else, including dedup.
        for arg in &bound.values {
            if let Argument::File(id) = arg {
                let file = self.store.get_file(id)?;
                self.files.require_fresh(&file)?;
            }
        }

        if pipe.is_deterministic {
            if let Some(task) = self.store.get_task_by_fingerprint(fp)? {
                if self.outputs_valid(&task)? {
                    debug!(task_id = %task.id, pipe = %pipe.identity, "dedup hit");
                    return Ok(task);
                }
                debug!(task_id = %task.id, "prior task outputs invalid, re-running");
            }
        }

        let mut resolved = Vec::with_capacity(bound.values.len());
        for arg in &bound.values {
            resolved.push(self.resolve_argument(arg)?);
        }
        let (func, output_func) = self.registry.callables(&pipe.id)?;

        let run = self
            .pool
            .submit(TaskSpec {
                func,
                output_func,
                args: resolved,
            })
            .await?;

        let mut output_paths = Vec::with_capacity(run.output_paths.len());
        for path in &run.output_paths {
            output_paths.push(std::path::absolute(path)?);
        }

        let task_id = TaskId::new();
        let resource_id = ResourceId::new();
        let vault_hash = if pipe.return_volatile {
            self.volatile.lock().insert(resource_id.clone(), run.value);
            None
        } else {
            Some(self.vault.put(&run.value)?)
        };
        let resource = Resource {
            id: resource_id.clone(),
            task_id: task_id.clone(),
            ordinal: 0,
            vault_hash,
            volatile: pipe.return_volatile,
            description: None,
        };

        let mut outputs = vec![OutputRef::Resource(resource_id.clone())];
        let mut new_files = Vec::new();
        let mut overwritten = Vec::new();
        for path in &output_paths {
            let (size, md5) = match files::snapshot(path) {
                Ok(snap) => snap,
                Err(WeirError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.volatile.lock().remove(&resource_id);
                    return Err(WeirError::PipeExecution(anyhow::anyhow!(
                        "declared output file {} was not produced",
                        path.display()
                    )));
                }
                Err(e) => {
                    self.volatile.lock().remove(&resource_id);
                    return Err(e);
                }
            };
            if let Some(displaced) = self.store.current_file_at(path)? {
                overwritten.push(displaced.id);
            }
            let file = FileResource {
                id: FileId::new(),
                task_id: Some(task_id.clone()),
                path: path.clone(),
                size,
                md5,
                registered_at: run.finished_at,
                description: None,
            };
            outputs.push(OutputRef::File(file.id.clone()));
            new_files.push(file);
        }

        let task = Task {
            id: task_id,
            pipe_id: pipe.id.clone(),
            fingerprint: fp.to_string(),
            inputs: bound.values,
            outputs,
            started_at: run.started_at,
            finished_at: run.finished_at,
            description: None,
        };
        if let Err(e) = self
            .store
            .put_task(&task, &[resource], &new_files, &overwritten)
        {
            self.volatile.lock().remove(&resource_id);
            return Err(e.into());
        }

        // An obsolete input taints the new task and its outputs.
        if self.any_input_obsolete(&task)? {
            let mut tainted = vec![NodeRef::Task(task.id.clone())];
            tainted.extend(task.outputs.iter().map(NodeRef::from));
            self.store.mark_info_all(&tainted, flag::OBSOLETE, None)?;
            warn!(task_id = %task.id, "task ran with obsolete inputs");
        }

        info!(
            task_id = %task.id,
            pipe = %pipe.identity,
            outputs = task.outputs.len(),
            "task recorded"
        );
        Ok(task)
    }

    fn any_input_obsolete(&self, task: &Task) -> Result<bool> {
        for input in &task.inputs {
            let node = match input {
                Argument::Resource(id) => NodeRef::Resource(id.clone()),
                Argument::File(id) => NodeRef::File(id.clone()),
                _ => continue,
            };
            if self.store.has_flag(&node, flag::OBSOLETE)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn gate(&self, fp: &str) -> Gate {
        self.in_flight
            .lock()
            .entry(fp.to_string())
            .or_default()
            .clone()
    }

    fn release_gate(&self, fp: &str, gate: Gate) {
        drop(gate);
        let mut gates = self.in_flight.lock();
        if let Some(entry) = gates.get(fp) {
            if Arc::strong_count(entry) == 1 {
                gates.remove(fp);
            }
        }
    }
}
