//! Typed identifiers for graph entities.
//!
//! Every persistent entity is keyed by a random uuid rendered to a string;
//! wrapping each kind in its own newtype keeps pipe, task, and node ids
//! from being interchanged at compile time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

entity_id!(
    /// Identifies a registered pipe definition.
    PipeId
);
entity_id!(
    /// Identifies one committed execution of a pipe.
    TaskId
);
entity_id!(
    /// Identifies an in-memory value produced by a task.
    ResourceId
);
entity_id!(
    /// Identifies a tracked on-disk artifact.
    FileId
);
entity_id!(
    /// Identifies a planned-but-not-yet-run task inside a batch.
    UnrunId
);
entity_id!(
    /// Identifies the placeholder output of an unrun task.
    VirtualId
);
