//! The engine facade.
//!
//! `Weir` owns the store, vault, registry, and worker pool, and exposes
//! the whole programmatic surface: registration, execution (direct and
//! batched), queries, and maintenance.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use weir_model::{
    flag, Argument, FileId, FileResource, NodeRef, Pipe, PipeId, PipeIdentity, Resource,
    ResourceId, Task, TaskId, Value,
};
use weir_store::{Store, TaskQuery, Vault};

use crate::builder::{self, Batch, BatchReport};
use crate::error::Result;
use crate::executor::Executor;
use crate::files::Integrity;
use crate::registry::PipeSpec;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct WeirConfig {
    /// Maximum number of concurrently running pipe invocations.
    pub workers: usize,
}

impl Default for WeirConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// A provenance engine instance over one database and one vault.
pub struct Weir {
    exec: Arc<Executor>,
}

impl Weir {
    /// Create a fresh database at `db_path` (failing if one exists) with
    /// a vault at `vault_dir`.
    pub fn create(db_path: impl AsRef<Path>, vault_dir: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_config(db_path, vault_dir, WeirConfig::default())
    }

    pub fn create_with_config(
        db_path: impl AsRef<Path>,
        vault_dir: impl AsRef<Path>,
        config: WeirConfig,
    ) -> Result<Self> {
        let store = Store::create(db_path)?;
        let vault = Vault::open(vault_dir.as_ref())?;
        Ok(Self::assemble(store, vault, config))
    }

    /// Open an existing (or new) database and vault.
    pub fn open(db_path: impl AsRef<Path>, vault_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(db_path, vault_dir, WeirConfig::default())
    }

    pub fn open_with_config(
        db_path: impl AsRef<Path>,
        vault_dir: impl AsRef<Path>,
        config: WeirConfig,
    ) -> Result<Self> {
        let store = Store::open(db_path)?;
        let vault = Vault::open(vault_dir.as_ref())?;
        Ok(Self::assemble(store, vault, config))
    }

    fn assemble(store: Store, vault: Vault, config: WeirConfig) -> Self {
        info!(workers = config.workers, "engine ready");
        Self {
            exec: Arc::new(Executor::new(store, vault, config.workers)),
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a pipe (or return the existing one with this identity).
    pub fn register_pipe(&self, spec: PipeSpec) -> Result<Pipe> {
        self.exec.registry.register(&self.exec.store, spec)
    }

    /// Look up a previously registered pipe by module path.
    pub fn find_pipe(&self, module: &str, name: &str) -> Result<Option<Pipe>> {
        Ok(self
            .exec
            .store
            .get_pipe_by_identity(&PipeIdentity::named(module, name))?)
    }

    /// Track an existing file. See [`crate::files`] for the overwrite
    /// rules.
    pub fn register_file(&self, path: impl AsRef<Path>, force: bool) -> Result<FileResource> {
        self.exec.files.register(path.as_ref(), force)
    }

    /// The current file resource at `path`.
    pub fn file_from_path(&self, path: impl AsRef<Path>) -> Result<FileResource> {
        self.exec.files.from_path(path.as_ref())
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Invoke a pipe. Returns the committed task, either freshly run or
    /// the deduplicated prior execution.
    pub async fn run(
        &self,
        pipe: &Pipe,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<Task> {
        let bound = pipe.signature.bind(args, kwargs)?;
        self.exec.run_bound(pipe, bound).await
    }

    /// The payload of a resource (reloading from the vault as needed).
    pub fn resource_content(&self, id: &ResourceId) -> Result<Value> {
        self.exec.resource_content(id)
    }

    /// Start planning a deferred batch of calls.
    pub fn batch(&self) -> Batch {
        Batch::new()
    }

    /// Execute a planned batch over the worker pool, respecting dataflow
    /// order.
    pub async fn execute_batch(&self, batch: Batch) -> Result<BatchReport> {
        builder::execute(&self.exec, batch).await
    }

    /// Stop accepting new work; running tasks finish and persist.
    pub fn shutdown(&self) {
        self.exec.pool.shutdown();
    }

    // ── Lookup and query ────────────────────────────────────────────

    pub fn get_pipe(&self, id: &PipeId) -> Result<Pipe> {
        Ok(self.exec.store.get_pipe(id)?)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        Ok(self.exec.store.get_task(id)?)
    }

    pub fn get_resource(&self, id: &ResourceId) -> Result<Resource> {
        Ok(self.exec.store.get_resource(id)?)
    }

    pub fn get_file(&self, id: &FileId) -> Result<FileResource> {
        Ok(self.exec.store.get_file(id)?)
    }

    /// Tasks matching a composable predicate.
    pub fn search_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskId>> {
        Ok(self.exec.store.search_tasks(query)?)
    }

    /// Everything upstream of `starts` (inputs, their producers, and so
    /// on), to `depth` steps.
    pub fn ancestors(
        &self,
        starts: &[NodeRef],
        depth: Option<u32>,
    ) -> Result<HashSet<NodeRef>> {
        Ok(self.exec.store.ancestors(starts, depth)?)
    }

    /// Everything derived from `starts`, to `depth` steps.
    pub fn descendants(
        &self,
        starts: &[NodeRef],
        depth: Option<u32>,
    ) -> Result<HashSet<NodeRef>> {
        Ok(self.exec.store.descendants(starts, depth)?)
    }

    /// The task that produced a node, if any.
    pub fn producing_task(&self, node: &NodeRef) -> Result<Option<TaskId>> {
        Ok(self.exec.store.producing_task(node)?)
    }

    /// Tasks consuming a node as input.
    pub fn consumers(&self, node: &NodeRef) -> Result<Vec<TaskId>> {
        Ok(self.exec.store.consumers(node)?)
    }

    pub fn has_info(&self, node: &NodeRef, flag: &str) -> Result<bool> {
        Ok(self.exec.store.has_flag(node, flag)?)
    }

    pub fn info(&self, node: &NodeRef) -> Result<BTreeMap<String, Option<String>>> {
        Ok(self.exec.store.info_flags(node)?)
    }

    pub fn count_tasks(&self) -> Result<u64> {
        Ok(self.exec.store.count_tasks()?)
    }

    /// The uuid minted when the database was created.
    pub fn database_id(&self) -> Result<String> {
        Ok(self.exec.store.database_id()?)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Flag a node and everything derived from it as obsolete. Obsolete
    /// tasks are excluded from dedup, so re-invoking their pipe re-runs
    /// it. Returns the flagged nodes.
    pub fn mark_obsolete(&self, node: &NodeRef) -> Result<Vec<NodeRef>> {
        self.propagate_flag(node, flag::OBSOLETE, true)
    }

    /// User-level retirement of a node, optionally propagated downstream.
    /// Deprecated tasks are excluded from dedup.
    pub fn mark_deprecated(&self, node: &NodeRef, downstream: bool) -> Result<Vec<NodeRef>> {
        self.propagate_flag(node, flag::DEPRECATED, downstream)
    }

    fn propagate_flag(
        &self,
        node: &NodeRef,
        flag: &str,
        downstream: bool,
    ) -> Result<Vec<NodeRef>> {
        let mut targets = vec![node.clone()];
        if downstream {
            targets.extend(self.exec.store.descendants(std::slice::from_ref(node), None)?);
        }
        let stamp = Utc::now().to_rfc3339();
        self.exec
            .store
            .mark_info_all(&targets, flag, Some(&stamp))?;
        info!(flag, nodes = targets.len(), "flag propagated");
        Ok(targets)
    }

    /// Check every current file resource against the disk. Returns the
    /// ones that no longer match.
    pub fn integrity_sweep(&self, deep: bool) -> Result<Vec<(FileResource, Integrity)>> {
        let mut findings = Vec::new();
        for file in self.exec.store.current_files()? {
            let state = self.exec.files.integrity(&file, deep)?;
            if state != Integrity::Ok {
                findings.push((file, state));
            }
        }
        Ok(findings)
    }

    /// Check a single file resource against the disk.
    pub fn integrity_check(&self, file: &FileResource, deep: bool) -> Result<Integrity> {
        self.exec.files.integrity(file, deep)
    }

    /// Remove vault entries no resource references. Returns how many
    /// entries were removed.
    pub fn sweep_vault(&self) -> Result<usize> {
        let live = self.exec.store.referenced_vault_hashes()?;
        Ok(self.exec.vault.sweep(&live)?)
    }

    /// Delete entities outright; refuses to break provenance edges.
    pub fn delete(&self, nodes: &[NodeRef]) -> Result<()> {
        Ok(self.exec.store.delete(nodes)?)
    }
}
