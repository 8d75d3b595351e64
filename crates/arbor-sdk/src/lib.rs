//! High-level SDK for Arbor.
//!
//! [`Arbor`] ties one state tree to its driver stack and hook dispatcher.
//! This is the main entry point for applications embedding Arbor.
//!
//! ```
//! use std::sync::Arc;
//!
//! use arbor_sdk::{Arbor, Node, Record, RecordShape, Schema, TypeRef};
//!
//! let schema = Arc::new(
//!     Schema::new(TypeRef::named("Doc"))
//!         .record("Doc", RecordShape::new().field("name", TypeRef::Text)),
//! );
//! let arbor = Arbor::builder("doc", schema)
//!     .default_root(|| Node::from(Record::new("Doc").with_field("name", "Bob")))
//!     .build()
//!     .unwrap();
//!
//! arbor.replace("/name", "Alice").unwrap();
//! arbor.flush().unwrap();
//! assert_eq!(arbor.get("/name").unwrap(), Node::text("Alice"));
//! ```

pub mod arbor;
pub mod config;
pub mod error;

pub use arbor::{Arbor, ArborBuilder};
pub use config::ArborConfig;
pub use error::{SdkError, SdkResult};

// Re-export key types
pub use arbor_driver::{Driver, DriverError, DriverFactory};
pub use arbor_hooks::{HookContext, HookError, HookFailure, HookHandle};
pub use arbor_refs::Reference;
pub use arbor_replica::{DurableStore, InMemoryDurableStore, ReplicaConfig, ReplicaState};
pub use arbor_tree::{Diagnostics, PreconditionPolicy, ReadSession, Update};
pub use arbor_types::{Catalog, Identifier, Node, Path, Record, RecordShape, Schema, TypeRef};
