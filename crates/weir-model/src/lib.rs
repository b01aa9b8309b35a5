//! Data model for the weir provenance engine.
//!
//! The provenance record is a directed acyclic graph: resources and file
//! resources are nodes, tasks are edges. This crate defines the entity
//! types, the closed set of argument values, binding of call arguments
//! against a pipe's declared signature, and the canonical fingerprint that
//! drives execution deduplication. It is deliberately free of any storage
//! or runtime concern.

pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod signature;
pub mod value;

pub use entity::{flag, FileResource, NodeRef, OutputRef, Pipe, PipeIdentity, Resource, Task};
pub use error::{ModelError, Result};
pub use fingerprint::{fingerprint, FingerprintAtom};
pub use id::{FileId, PipeId, ResourceId, TaskId, UnrunId, VirtualId};
pub use signature::{Argument, BoundArgs, Param, Signature};
pub use value::Value;
