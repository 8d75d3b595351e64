//! Error types for reference construction and resolution.

use arbor_types::TypeError;
use thiserror::Error;

/// Errors that can occur while building or resolving a reference.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// A segment has no child in the schema or in the tree.
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    /// The node found has a runtime kind incompatible with the target type.
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    /// A parameter placeholder was never bound.
    #[error("unbound parameter -{parameter}- in {path}")]
    UnboundParameter { path: String, parameter: String },

    /// Resolution through a tree requires an open read session.
    #[error("no read session is open on this thread")]
    NoReadSession,

    /// The textual path or type expression was malformed.
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Convenience type alias for reference operations.
pub type Result<T> = std::result::Result<T, ResolutionError>;
