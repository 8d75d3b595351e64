use arbor_refs::ResolutionError;
use arbor_tree::UpdateError;

/// Errors a hook callback can report.
///
/// These never reach the submitter of the update that fired the hook; the
/// dispatcher logs them and publishes them on its failure channel.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HookError {
    /// The callback gave up for a reason of its own.
    #[error("hook failed: {0}")]
    Failed(String),

    /// A read inside the callback failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// An update submitted by the callback was rejected.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// The callback panicked.
    #[error("hook panicked: {0}")]
    Panicked(String),
}

impl HookError {
    pub fn failed(reason: impl ToString) -> Self {
        HookError::Failed(reason.to_string())
    }
}

/// Convenience alias for hook callbacks.
pub type Result<T> = std::result::Result<T, HookError>;
