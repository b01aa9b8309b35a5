//! Deferred execution: plan a dataflow graph of calls, then run it.
//!
//! `Batch::call_pipe` records an unrun task and hands back a virtual
//! resource standing in for its result; virtual handles can be passed as
//! arguments to later calls, which is what wires the dataflow edges.
//! `execute` walks the graph in dependency order, running every ready
//! task on the worker pool, installing concrete replacements as tasks
//! complete, and skipping the transitive dependents of failures while
//! independent branches continue.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use weir_model::{Argument, BoundArgs, ModelError, OutputRef, Pipe, TaskId, UnrunId, VirtualId};

use crate::error::{Result, WeirError};
use crate::executor::Executor;

/// Which output of an unrun task a virtual resource stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VirtualTarget {
    Returned,
    OutputFile(usize),
}

struct VirtualSlot {
    id: VirtualId,
    producer: UnrunId,
    target: VirtualTarget,
    replacement: OnceLock<OutputRef>,
}

/// A placeholder for an output that does not exist yet. Cheap to clone;
/// once the producing task completes, `replacement` yields the concrete
/// node.
#[derive(Clone)]
pub struct VirtualHandle(Arc<VirtualSlot>);

impl VirtualHandle {
    fn new(producer: UnrunId, target: VirtualTarget) -> Self {
        Self(Arc::new(VirtualSlot {
            id: VirtualId::new(),
            producer,
            target,
            replacement: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> &VirtualId {
        &self.0.id
    }

    /// The concrete output this placeholder resolved to, once the batch
    /// has executed.
    pub fn replacement(&self) -> Option<OutputRef> {
        self.0.replacement.get().cloned()
    }
}

impl std::fmt::Debug for VirtualHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHandle")
            .field("id", &self.0.id)
            .field("resolved", &self.0.replacement.get().is_some())
            .finish()
    }
}

impl From<&VirtualHandle> for Argument {
    fn from(handle: &VirtualHandle) -> Self {
        Argument::Virtual(handle.0.id.clone())
    }
}

/// A planned call: the pipe, its bound (possibly virtual) arguments, and
/// the placeholders for its outputs.
struct UnrunTask {
    id: UnrunId,
    pipe: Pipe,
    bound: BoundArgs,
    returned: VirtualHandle,
    file_outputs: Vec<VirtualHandle>,
}

/// Lets the caller stop a batch mid-flight: no new tasks are submitted,
/// already-running tasks finish and persist.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// A deferred dependency graph of unrun tasks.
#[derive(Default)]
pub struct Batch {
    entries: Vec<UnrunTask>,
    cancelled: Arc<AtomicBool>,
}

impl Batch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Plan a call instead of executing it. Arguments may include virtual
    /// handles from earlier calls in this batch. Returns the placeholder
    /// for the returned resource.
    pub fn call_pipe(
        &mut self,
        pipe: &Pipe,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<VirtualHandle> {
        let bound = pipe.signature.bind(args, kwargs)?;
        let id = UnrunId::new();
        let returned = VirtualHandle::new(id.clone(), VirtualTarget::Returned);
        self.entries.push(UnrunTask {
            id,
            pipe: pipe.clone(),
            bound,
            returned: returned.clone(),
            file_outputs: Vec::new(),
        });
        Ok(returned)
    }

    /// A placeholder for the `index`-th declared output file of the task
    /// behind `handle`.
    pub fn planned_output_file(
        &mut self,
        handle: &VirtualHandle,
        index: usize,
    ) -> Result<VirtualHandle> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == handle.0.producer)
            .ok_or_else(|| {
                WeirError::Schema(ModelError::UnresolvedVirtual(handle.0.id.clone()))
            })?;
        let wanted = VirtualTarget::OutputFile(index);
        if let Some(existing) = entry.file_outputs.iter().find(|h| h.0.target == wanted) {
            return Ok(existing.clone());
        }
        let file_handle = VirtualHandle::new(entry.id.clone(), wanted);
        entry.file_outputs.push(file_handle.clone());
        Ok(file_handle)
    }

    /// A handle that cancels this batch when triggered.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancelled.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-task outcome of executing a batch.
#[derive(Debug)]
pub struct BatchReport {
    /// Unrun tasks resolved to a committed task, in completion order.
    /// Tasks folded together by fingerprint share a task id.
    pub completed: Vec<(UnrunId, TaskId)>,
    /// Unrun tasks whose execution failed, with the failure text.
    pub failed: Vec<(UnrunId, String)>,
    /// Unrun tasks never submitted because a dependency failed or the
    /// batch was cancelled.
    pub skipped: Vec<UnrunId>,
    /// Whether cancellation stopped submission.
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Run a batch to completion over the executor.
pub(crate) async fn execute(exec: &Executor, batch: Batch) -> Result<BatchReport> {
    let cancelled = batch.cancelled;
    let entries = batch.entries;

    // Map each virtual id to its slot, and each entry to the entries it
    // waits on. Handles minted by this batch always point at earlier
    // entries, so a dependency on a later index means the graph is not a
    // DAG.
    let mut slots: HashMap<VirtualId, VirtualHandle> = HashMap::new();
    let mut index_of: HashMap<UnrunId, usize> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        index_of.insert(entry.id.clone(), i);
        slots.insert(entry.returned.0.id.clone(), entry.returned.clone());
        for handle in &entry.file_outputs {
            slots.insert(handle.0.id.clone(), handle.clone());
        }
    }

    let mut waits_on: Vec<HashSet<usize>> = vec![HashSet::new(); entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        for virtual_id in entry.bound.virtual_refs() {
            let slot = slots.get(virtual_id).ok_or_else(|| {
                WeirError::Schema(ModelError::UnresolvedVirtual((*virtual_id).clone()))
            })?;
            let producer = *index_of
                .get(&slot.0.producer)
                .expect("slot producers are batch entries");
            if producer >= i {
                return Err(WeirError::CycleDetected);
            }
            if waits_on[i].insert(producer) {
                dependents[producer].push(i);
            }
        }
    }

    let mut status: Vec<Status> = vec![Status::Pending; entries.len()];
    let mut ready: BTreeSet<usize> = (0..entries.len())
        .filter(|i| waits_on[*i].is_empty())
        .collect();
    let mut report = BatchReport {
        completed: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
        cancelled: false,
    };
    let mut in_flight = FuturesUnordered::new();

    info!(tasks = entries.len(), "executing batch");
    loop {
        while let Some(i) = ready.pop_first() {
            if cancelled.load(Ordering::SeqCst) {
                status[i] = Status::Skipped;
                report.skipped.push(entries[i].id.clone());
                continue;
            }
            match resolve_bound(&entries[i], &slots) {
                Ok(bound) => {
                    status[i] = Status::Running;
                    let pipe = entries[i].pipe.clone();
                    in_flight.push(async move { (i, exec.run_bound(&pipe, bound).await) });
                }
                Err(reason) => {
                    status[i] = Status::Failed;
                    report.failed.push((entries[i].id.clone(), reason));
                    skip_dependents(i, &dependents, &mut status, &entries, &mut report);
                }
            }
        }

        if in_flight.is_empty() {
            if cancelled.load(Ordering::SeqCst) {
                for (i, entry) in entries.iter().enumerate() {
                    if status[i] == Status::Pending {
                        status[i] = Status::Skipped;
                        report.skipped.push(entry.id.clone());
                    }
                }
                report.cancelled = true;
                break;
            }
            if status.iter().all(|s| *s != Status::Pending) {
                break;
            }
            // Pending work that can never become ready.
            return Err(WeirError::CycleDetected);
        }

        let Some((i, result)) = in_flight.next().await else {
            continue;
        };
        match result {
            Ok(task) => {
                install_replacements(&entries[i], &task);
                status[i] = Status::Completed;
                report.completed.push((entries[i].id.clone(), task.id.clone()));
                debug!(task_id = %task.id, "batch task completed");
                for &dependent in &dependents[i] {
                    if status[dependent] != Status::Pending {
                        continue;
                    }
                    waits_on[dependent].remove(&i);
                    if waits_on[dependent].is_empty() {
                        ready.insert(dependent);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "batch task failed");
                status[i] = Status::Failed;
                report.failed.push((entries[i].id.clone(), e.to_string()));
                skip_dependents(i, &dependents, &mut status, &entries, &mut report);
            }
        }
    }

    info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "batch finished"
    );
    Ok(report)
}

/// Swap virtual arguments for the concrete outputs their producers
/// resolved to. Errors describe why this entry cannot run.
fn resolve_bound(
    entry: &UnrunTask,
    slots: &HashMap<VirtualId, VirtualHandle>,
) -> std::result::Result<BoundArgs, String> {
    let mut bound = entry.bound.clone();
    for arg in &mut bound.values {
        if let Argument::Virtual(virtual_id) = arg {
            let slot = slots
                .get(virtual_id)
                .expect("virtual arguments were validated before scheduling");
            let Some(replacement) = slot.replacement() else {
                return Err(format!(
                    "virtual resource {virtual_id} was never produced by its task"
                ));
            };
            *arg = match replacement {
                OutputRef::Resource(id) => Argument::Resource(id),
                OutputRef::File(id) => Argument::File(id),
            };
        }
    }
    Ok(bound)
}

/// Install concrete outputs into the entry's placeholders.
fn install_replacements(entry: &UnrunTask, task: &weir_model::Task) {
    if let Some(returned) = task.returned() {
        let _ = entry
            .returned
            .0
            .replacement
            .set(OutputRef::Resource(returned.clone()));
    }
    let files: Vec<_> = task.output_files().collect();
    for handle in &entry.file_outputs {
        let VirtualTarget::OutputFile(index) = handle.0.target else {
            continue;
        };
        match files.get(index) {
            Some(file_id) => {
                let _ = handle
                    .0
                    .replacement
                    .set(OutputRef::File((*file_id).clone()));
            }
            None => warn!(
                index,
                task_id = %task.id,
                "planned output file index beyond produced outputs"
            ),
        }
    }
}

/// Mark every transitive dependent of `start` as skipped.
fn skip_dependents(
    start: usize,
    dependents: &[Vec<usize>],
    status: &mut [Status],
    entries: &[UnrunTask],
    report: &mut BatchReport,
) {
    let mut queue: VecDeque<usize> = dependents[start].iter().copied().collect();
    while let Some(i) = queue.pop_front() {
        if status[i] != Status::Pending {
            continue;
        }
        status[i] = Status::Skipped;
        report.skipped.push(entries[i].id.clone());
        queue.extend(dependents[i].iter().copied());
    }
}
