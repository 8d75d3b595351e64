//! Foundation types for Arbor.
//!
//! This crate provides the value model of the state tree and the static type
//! registry that describes it. Every other Arbor crate depends on
//! `arbor-types`.
//!
//! # Key Types
//!
//! - [`Identifier`]: Opaque, comparable name of an entity within its container
//! - [`Path`]: Ordered sequence of literal or parameter [`Segment`]s
//! - [`Node`]: Immutable tree value; containers are shared behind `Arc`
//! - [`Catalog`], [`Listing`], [`SideTable`]: Keyed containers
//! - [`Record`], [`Variant`]: Fixed-shape records and tagged unions
//! - [`Schema`]: Declarative type-descriptor registry ([`TypeRef`], [`TypeDef`])

pub mod error;
pub mod identifier;
pub mod node;
pub mod path;
pub mod schema;

pub use error::TypeError;
pub use identifier::Identifier;
pub use node::{Catalog, Listing, Node, NodeKind, Record, SideTable, Variant};
pub use path::{Path, Segment};
pub use schema::{FieldShape, RecordShape, Schema, TypeDef, TypeRef, VariantFamily};
