//! Persistent entities of the provenance graph.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::{FileId, PipeId, ResourceId, TaskId};
use crate::signature::{Argument, Signature};

/// Status flags recognized in the `info` set of an entity.
pub mod flag {
    /// A newer file resource replaced this one at the same path.
    pub const OVERWRITTEN: &str = "overwritten";
    /// An ancestor was invalidated; propagated down the graph.
    pub const OBSOLETE: &str = "obsolete";
    /// User-marked retirement; excluded from dedup so a rerun happens.
    pub const DEPRECATED: &str = "deprecated";
    /// Captured source text of an anonymous pipe callable.
    pub const SOURCECODE: &str = "sourcecode";
    /// Captured source text of a pipe's output-path callable.
    pub const OUTPUTFUNC_SOURCECODE: &str = "outputfunc_sourcecode";
}

/// How a pipe is identified across processes.
///
/// Named pipes are importable by a stable module path; anonymous pipes are
/// identified by a hash of their normalized source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipeIdentity {
    Named { module: String, name: String },
    Anonymous { source_hash: String },
}

impl PipeIdentity {
    pub fn named(module: impl Into<String>, name: impl Into<String>) -> Self {
        PipeIdentity::Named {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Identity for a callable with no stable module path, derived from
    /// its source text. Line endings and trailing whitespace are
    /// normalized first so formatting churn does not fork the identity.
    pub fn from_source(source: &str) -> Self {
        PipeIdentity::Anonymous {
            source_hash: hex::encode(Sha256::digest(normalize_source(source))),
        }
    }

    /// Stable textual form used in fingerprints and log output.
    pub fn canonical(&self) -> String {
        match self {
            PipeIdentity::Named { module, name } => format!("{module}::{name}"),
            PipeIdentity::Anonymous { source_hash } => format!("anon:{source_hash}"),
        }
    }
}

impl std::fmt::Display for PipeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Normalize source text for identity hashing: unix line endings, no
/// trailing whitespace, no leading/trailing blank lines.
pub fn normalize_source(source: &str) -> String {
    let text = source.replace("\r\n", "\n");
    let mut lines: Vec<&str> = text.lines().map(|l| l.trim_end()).collect();
    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// A registered callable unit. Immutable once created; re-registering the
/// same identity returns the existing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipe {
    pub id: PipeId,
    pub identity: PipeIdentity,
    pub signature: Signature,
    /// The returned value is one-shot and never persisted to the vault.
    pub return_volatile: bool,
    /// When false, every call runs: dedup lookup is skipped.
    pub is_deterministic: bool,
    pub has_output_func: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One committed execution of a pipe with concrete arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub pipe_id: PipeId,
    pub fingerprint: String,
    /// Normalized arguments, in bound order. Never contains `Virtual`.
    pub inputs: Vec<Argument>,
    /// Ordered outputs: the returned resource first, then one file
    /// resource per declared output path.
    pub outputs: Vec<OutputRef>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub description: Option<String>,
}

impl Task {
    /// The resource holding the pipe's return value.
    pub fn returned(&self) -> Option<&ResourceId> {
        self.outputs.iter().find_map(|o| match o {
            OutputRef::Resource(id) => Some(id),
            OutputRef::File(_) => None,
        })
    }

    /// File resources produced by this task, in declared path order.
    pub fn output_files(&self) -> impl Iterator<Item = &FileId> {
        self.outputs.iter().filter_map(|o| match o {
            OutputRef::File(id) => Some(id),
            OutputRef::Resource(_) => None,
        })
    }
}

/// A reference to one task output, by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputRef {
    Resource(ResourceId),
    File(FileId),
}

/// An in-memory value produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub task_id: TaskId,
    /// Position in the producing task's output list.
    pub ordinal: u32,
    /// Content address in the vault; `None` for volatile payloads.
    pub vault_hash: Option<String>,
    pub volatile: bool,
    pub description: Option<String>,
}

/// An on-disk artifact tracked by absolute path.
///
/// The stored path is absolute but deliberately not symlink-resolved, and
/// `task_id` is `None` for externally registered files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResource {
    pub id: FileId,
    pub task_id: Option<TaskId>,
    pub path: PathBuf,
    pub size: u64,
    pub md5: String,
    pub registered_at: DateTime<Utc>,
    pub description: Option<String>,
}

/// A reference to any persistent entity, used by flags, queries, and
/// graph traversals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    Pipe(PipeId),
    Task(TaskId),
    Resource(ResourceId),
    File(FileId),
}

impl NodeRef {
    /// The kind discriminator used in storage.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeRef::Pipe(_) => "pipe",
            NodeRef::Task(_) => "task",
            NodeRef::Resource(_) => "resource",
            NodeRef::File(_) => "file",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            NodeRef::Pipe(id) => id.as_str(),
            NodeRef::Task(id) => id.as_str(),
            NodeRef::Resource(id) => id.as_str(),
            NodeRef::File(id) => id.as_str(),
        }
    }
}

impl From<&OutputRef> for NodeRef {
    fn from(output: &OutputRef) -> Self {
        match output {
            OutputRef::Resource(id) => NodeRef::Resource(id.clone()),
            OutputRef::File(id) => NodeRef::File(id.clone()),
        }
    }
}
