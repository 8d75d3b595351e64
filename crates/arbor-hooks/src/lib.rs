//! Hook dispatch for Arbor state trees.
//!
//! A hook is a callback registered against a scope: a reference that may
//! carry parameters, such as `/items/-item-`. After every commit whose
//! target overlaps the scope, the [`HookDispatcher`] fires the hook once for
//! each concrete instance of the scope the commit affected. Each firing runs
//! in a read session pinned to the committed snapshot, inside the diagnostic
//! context of the thread that submitted the update.
//!
//! Hook failures never reach the submitter. They are logged and published
//! on [`HookDispatcher::failures`].

pub mod dispatcher;
pub mod error;

// Re-exports for convenience.
pub use dispatcher::{overlaps, HookContext, HookDispatcher, HookFailure, HookHandle};
pub use error::{HookError, Result};
