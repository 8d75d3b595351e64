//! Error types for state-tree updates.

use arbor_refs::ResolutionError;
use thiserror::Error;

/// Errors that can occur while applying an update or committing it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// A creation targeted an identifier that is already present.
    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    /// The target cannot be removed from its parent.
    #[error("not deletable: {path}: {reason}")]
    NotDeletable { path: String, reason: String },

    /// The value at the precondition reference differs from the expected one.
    #[error("precondition failed at {path}: {reason}")]
    PreconditionFailed { path: String, reason: String },

    /// A conditional creation found a different value already present.
    #[error("creation conflict: {path} holds a different value")]
    CreationConflict { path: String },

    /// A catalog entry's `id` does not equal the key it is stored under.
    #[error("id mismatch at {path}: stored under {key} but carries {found}")]
    IdMismatch {
        path: String,
        key: String,
        found: String,
    },

    /// Phantom positions never hold a value.
    #[error("cannot write phantom position {path}")]
    PhantomTarget { path: String },

    /// The target cannot be written through this kind of container.
    #[error("unsupported target {path}: {reason}")]
    UnsupportedTarget { path: String, reason: String },

    /// The new value does not have the type declared at the target.
    #[error("type mismatch at {path}: {reason}")]
    TypeMismatch { path: String, reason: String },

    /// `initialize` was called on a tree that already has a root.
    #[error("tree is already initialized")]
    AlreadyInitialized,

    /// The tree has no root yet.
    #[error("tree is not initialized")]
    NotInitialized,

    /// The target or precondition could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl UpdateError {
    /// Returns `true` for failures caused by the current contents of the
    /// tree rather than by a malformed update.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            UpdateError::AlreadyExists { .. }
                | UpdateError::PreconditionFailed { .. }
                | UpdateError::CreationConflict { .. }
        )
    }
}

/// Convenience type alias for state-tree operations.
pub type Result<T> = std::result::Result<T, UpdateError>;
