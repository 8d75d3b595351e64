use arbor_driver::DriverError;
use thiserror::Error;

/// Errors reported by a [`DurableStore`](crate::DurableStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached right now.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A conditional write lost to a concurrent writer.
    #[error("revision mismatch: expected {expected}, store is at {actual}")]
    RevisionMismatch { expected: u64, actual: u64 },

    /// The history after the resume token is no longer retained.
    #[error("resume token {token} has expired")]
    TokenExpired { token: u64 },

    /// Any other failure of the backing system.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Errors from encoding or decoding tree values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("cannot encode value at {path}: {reason}")]
    Encode { path: String, reason: String },

    #[error("cannot decode value at {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { reason } => DriverError::Disconnected { reason },
            StoreError::TokenExpired { .. } => DriverError::Disconnected {
                reason: err.to_string(),
            },
            StoreError::RevisionMismatch { .. } | StoreError::Backend(_) => {
                DriverError::Backend(err.to_string())
            }
        }
    }
}

impl From<CodecError> for DriverError {
    fn from(err: CodecError) -> Self {
        DriverError::Backend(err.to_string())
    }
}

/// Convenience alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Convenience alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
