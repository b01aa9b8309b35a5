//! Weir is a workflow and provenance engine for computational analyses.
//!
//! Users register callable units (pipes) and invoke them with concrete
//! arguments; the engine records every execution (task) together with its
//! inputs and outputs (resources and file resources) in a SQLite-backed
//! store. Deterministic re-invocations with the same canonical fingerprint
//! reuse the prior task instead of re-executing. Calls can also be planned
//! into a deferred batch (a dataflow graph of unrun tasks and virtual
//! resources) and executed in parallel on a bounded worker pool.
//!
//! ```no_run
//! # async fn demo() -> weir::Result<()> {
//! use weir::{PipeSpec, Signature, Value, Weir};
//!
//! let weir = Weir::create("analysis.db", "vault")?;
//! let add = weir.register_pipe(
//!     PipeSpec::named("demo", "add", |args| {
//!         Ok(Value::Int(args[0].as_int().unwrap() + args[1].as_int().unwrap()))
//!     })
//!     .with_signature(Signature::positional(&["i", "j"])),
//! )?;
//!
//! let task = weir.run(&add, vec![1.into(), 2.into()], Default::default()).await?;
//! let sum = weir.resource_content(task.returned().unwrap())?;
//! assert_eq!(sum, Value::Int(3));
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod engine;
pub mod error;
mod executor;
pub mod files;
mod pool;
pub mod registry;

pub use builder::{Batch, BatchReport, VirtualHandle};
pub use engine::{Weir, WeirConfig};
pub use error::{Result, WeirError};
pub use files::Integrity;
pub use registry::{OutputFn, PipeFn, PipeSpec};

pub use weir_model::{
    flag, Argument, BoundArgs, FileId, FileResource, NodeRef, OutputRef, Param, Pipe,
    PipeId, PipeIdentity, Resource, ResourceId, Signature, Task, TaskId, UnrunId, Value,
    VirtualId,
};
pub use weir_store::TaskQuery;
