//! Error types for the model crate.

use thiserror::Error;

/// Errors raised while binding arguments or encoding values.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A keyword argument names a parameter the signature does not declare.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    /// A parameter received both a positional and a keyword value.
    #[error("duplicate value for parameter `{0}`")]
    DuplicateArgument(String),

    /// A required parameter has neither a value nor a declared default.
    #[error("missing required parameter `{0}`")]
    MissingArgument(String),

    /// More positional arguments than declared parameters, without a
    /// variadic tail to absorb them.
    #[error("{got} positional arguments exceed the {declared} declared parameters")]
    TooManyArguments { declared: usize, got: usize },

    /// An argument still references a virtual resource where a concrete
    /// node is required.
    #[error("argument references unresolved virtual resource {0}")]
    UnresolvedVirtual(crate::id::VirtualId),
}

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
