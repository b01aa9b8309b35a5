//! Durable storage for the weir provenance engine.
//!
//! Two halves: a single-file SQLite database holding pipes, tasks,
//! resources, file resources, and their edges ([`Store`]), and a
//! content-addressed directory holding serialized resource payloads
//! ([`Vault`]). A task exists in the database if and only if all of its
//! outputs do; every multi-row write runs inside one transaction.

pub mod error;
pub mod query;
mod schema;
pub mod store;
pub mod vault;

pub use error::{Result, StoreError};
pub use query::TaskQuery;
pub use store::Store;
pub use vault::Vault;
