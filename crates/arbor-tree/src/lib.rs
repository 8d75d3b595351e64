//! The Arbor state tree.
//!
//! A tree instance holds one immutable, structurally shared [`Node`] root
//! behind a [`StateTree`]. Updates are a closed set of [`Update`] commands
//! applied by the pure, copy-on-write [`apply`]; each successful apply
//! becomes a new [`Snapshot`] with the next revision.
//!
//! # Modules
//!
//! - [`error`]: [`UpdateError`] and the crate `Result` alias
//! - [`update`]: [`Update`], [`Applied`], [`apply`]
//! - [`precondition`]: [`PreconditionPolicy`] and per-kind [`EqualityMode`]
//! - [`state`]: [`StateTree`], [`Snapshot`], [`Commit`], [`CommitObserver`]
//! - [`session`]: thread-scoped [`ReadSession`] pins
//! - [`diagnostic`]: [`DiagnosticContext`] and its RAII [`DiagnosticScope`]
//!
//! [`Node`]: arbor_types::Node

pub mod diagnostic;
pub mod error;
pub mod precondition;
pub mod session;
pub mod state;
pub mod update;

pub use diagnostic::{DiagnosticContext, DiagnosticScope, Diagnostics};
pub use error::{Result, UpdateError};
pub use precondition::{EqualityMode, PreconditionPolicy};
pub use session::ReadSession;
pub use state::{Commit, CommitObserver, Snapshot, StateTree, TreeId};
pub use update::{apply, entry_at, Applied, Update, UpdateKind};
