//! Error types for the driver pipeline.

use std::time::Duration;

use arbor_tree::UpdateError;
use thiserror::Error;

/// Errors that a driver can return from `initial_root`, `submit` or `flush`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The update itself was rejected by the tree.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// The driver lost its connection and is trying to recover.
    #[error("disconnected: {reason}")]
    Disconnected { reason: String },

    /// The driver was shut down.
    #[error("driver is closed")]
    Closed,

    /// The durable state was written with a different schema.
    #[error("manifest mismatch: local schema {expected}, durable state {found}")]
    ManifestMismatch { expected: String, found: String },

    /// No durable state exists and the bootstrap policy forbids seeding.
    #[error("no durable state in collection {collection}")]
    NoDurableState { collection: String },

    /// The external store could not be reached at bootstrap.
    #[error("store unreachable: {reason}")]
    Unreachable { reason: String },

    /// Conditional writes kept losing to concurrent writers.
    #[error("write conflict on {path} after {attempts} attempts")]
    Conflict { path: String, attempts: u32 },

    /// The flush barrier did not complete in time.
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),

    /// After flush, the tree did not hold the last submitted value.
    #[error("flush verification failed at {path}: expected {expected}, found {found}")]
    FlushVerification {
        path: String,
        expected: String,
        found: String,
    },

    /// Any other failure reported by a backing system.
    #[error("backend error: {0}")]
    Backend(String),
}

impl DriverError {
    /// Returns `true` if the failure is about reaching the system, not about
    /// the contents of the tree.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DriverError::Disconnected { .. }
                | DriverError::Unreachable { .. }
                | DriverError::FlushTimeout(_)
        )
    }

    /// Returns `true` for stale preconditions and lost races, which callers
    /// are expected to handle by re-reading.
    pub fn is_expected_conflict(&self) -> bool {
        match self {
            DriverError::Conflict { .. } => true,
            DriverError::Update(e) => e.is_state_conflict(),
            _ => false,
        }
    }
}

/// Convenience type alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;
