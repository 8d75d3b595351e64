//! Replicating durable driver for Arbor state trees.
//!
//! [`ReplicatingDriver`] keeps every instance of a tree that points at the
//! same durable collection in sync:
//!
//! - At startup it loads the stored document, or seeds it from the default
//!   root, and checks the stored schema fingerprint.
//! - Each update is applied to the stored document with a conditional
//!   write, retried against fresh state when another writer wins.
//! - A listener thread follows the store's change feed and applies every
//!   change to the local tree in revision order, re-bootstrapping after
//!   gaps, expired resume tokens or outages.
//! - `flush` returns once the local tree reflects every change that was
//!   durable when it was called.
//!
//! The store itself sits behind [`DurableStore`]; [`InMemoryDurableStore`]
//! is a complete in-process implementation. Values cross the boundary
//! through a [`Codec`], by default [`JsonCodec`].

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
mod listener;
pub mod memory;
pub mod store;

// Re-exports for convenience.
pub use codec::{Codec, JsonCodec};
pub use config::{BootstrapConfig, MissingStatePolicy, ReplicaConfig, UnreachablePolicy};
pub use driver::{ReplicaHandle, ReplicaState, ReplicaStatus, ReplicatingDriver, LISTENER_THREAD};
pub use error::{CodecError, CodecResult, StoreError, StoreResult};
pub use memory::InMemoryDurableStore;
pub use store::{Change, ChangeEvent, ChangeOp, ChangeStream, DurableDocument, DurableStore, ResumeToken};
