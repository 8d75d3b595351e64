//! Typed references into the Arbor state tree.
//!
//! A [`Reference`] is a [`Path`](arbor_types::Path) paired with the static
//! type found at that position in the schema. References may carry
//! parameter placeholders (`/planets/-planet-/name`); a
//! [`BindingEnvironment`] substitutes concrete identifiers for them.
//!
//! Resolution is a pure function of a reference and a root node: the same
//! inputs always produce the same result, whichever thread asks.
//!
//! # Modules
//!
//! - [`error`]: [`ResolutionError`] and the crate `Result` alias
//! - [`reference`]: [`Reference`] and [`BindingEnvironment`]
//! - [`resolve`]: [`resolve()`], [`resolve_path`], [`dereference`]

pub mod error;
pub mod reference;
pub mod resolve;

pub use error::{ResolutionError, Result};
pub use reference::{BindingEnvironment, Reference};
pub use resolve::{conforms, dereference, resolve, resolve_path};
