//! Update commands and the copy-on-write apply.
//!
//! [`apply`] is a pure function: it never touches shared state, so the
//! local tree and the replicating driver run exactly the same checks
//! against whichever root they consider current.
//!
//! Walking from the root to the target, every container on the way is
//! copied with only the changed child replaced. Untouched siblings are
//! shared with the previous root by `Arc`.

use std::fmt;

use arbor_refs::{resolve, Reference, ResolutionError};
use arbor_types::{Identifier, Node, Path, Schema, Segment, TypeError, TypeRef};

use crate::error::{Result, UpdateError};
use crate::precondition::PreconditionPolicy;

/// The closed set of operations a driver can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    /// Insert or replace the value at `target`.
    Replace { target: Reference, value: Node },
    /// Replace if `precondition` currently resolves to `expected`.
    ConditionalReplace {
        target: Reference,
        value: Node,
        precondition: Reference,
        expected: Node,
    },
    /// Insert a value that must not exist yet.
    Create { target: Reference, value: Node },
    /// Insert unless an identical value is already present.
    ConditionalCreate { target: Reference, value: Node },
    /// Remove the value at `target` from its parent.
    Delete { target: Reference },
    /// Delete if `precondition` currently resolves to `expected`.
    ConditionalDelete {
        target: Reference,
        precondition: Reference,
        expected: Node,
    },
}

/// Discriminant of an [`Update`], used in logs and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Replace,
    ConditionalReplace,
    Create,
    ConditionalCreate,
    Delete,
    ConditionalDelete,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::Replace => "replace",
            UpdateKind::ConditionalReplace => "conditional_replace",
            UpdateKind::Create => "create",
            UpdateKind::ConditionalCreate => "conditional_create",
            UpdateKind::Delete => "delete",
            UpdateKind::ConditionalDelete => "conditional_delete",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self {
            Update::Replace { .. } => UpdateKind::Replace,
            Update::ConditionalReplace { .. } => UpdateKind::ConditionalReplace,
            Update::Create { .. } => UpdateKind::Create,
            Update::ConditionalCreate { .. } => UpdateKind::ConditionalCreate,
            Update::Delete { .. } => UpdateKind::Delete,
            Update::ConditionalDelete { .. } => UpdateKind::ConditionalDelete,
        }
    }

    pub fn target(&self) -> &Reference {
        match self {
            Update::Replace { target, .. }
            | Update::ConditionalReplace { target, .. }
            | Update::Create { target, .. }
            | Update::ConditionalCreate { target, .. }
            | Update::Delete { target }
            | Update::ConditionalDelete { target, .. } => target,
        }
    }

    /// The value written, or `None` for deletions.
    pub fn value(&self) -> Option<&Node> {
        match self {
            Update::Replace { value, .. }
            | Update::ConditionalReplace { value, .. }
            | Update::Create { value, .. }
            | Update::ConditionalCreate { value, .. } => Some(value),
            Update::Delete { .. } | Update::ConditionalDelete { .. } => None,
        }
    }

    /// The precondition reference, for conditional replace and delete.
    pub fn precondition(&self) -> Option<(&Reference, &Node)> {
        match self {
            Update::ConditionalReplace {
                precondition,
                expected,
                ..
            }
            | Update::ConditionalDelete {
                precondition,
                expected,
                ..
            } => Some((precondition, expected)),
            _ => None,
        }
    }

    /// Returns `true` if the outcome depends on the current tree contents.
    pub fn is_conditional(&self) -> bool {
        !matches!(self, Update::Replace { .. } | Update::Delete { .. })
    }
}

/// Outcome of [`apply`].
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// The update produced this new root.
    Changed(Node),
    /// The update was a no-op; no commit should be made.
    Unchanged,
}

/// Apply `update` to `root`, returning the new root.
///
/// # Examples
///
/// ```
/// use arbor_refs::Reference;
/// use arbor_tree::{apply, Applied, PreconditionPolicy, Update};
/// use arbor_types::{Node, Record, RecordShape, Schema, TypeRef};
///
/// let schema = Schema::new(TypeRef::named("Doc"))
///     .record("Doc", RecordShape::new().field("name", TypeRef::Text));
/// let root: Node = Record::new("Doc").with_field("name", "Bob").into();
/// let update = Update::Replace {
///     target: Reference::parse(&schema, "/name").unwrap(),
///     value: Node::text("Alice"),
/// };
/// let Applied::Changed(next) = apply(&schema, &PreconditionPolicy::default(), &root, &update).unwrap()
/// else { panic!("expected a change") };
/// assert_eq!(next.as_record().unwrap().field("name"), Some(&Node::text("Alice")));
/// ```
pub fn apply(
    schema: &Schema,
    policy: &PreconditionPolicy,
    root: &Node,
    update: &Update,
) -> Result<Applied> {
    let target = update.target();
    target.ensure_concrete()?;
    let path = target.path();

    let declared = schema.type_at(path).map_err(|e| match e {
        TypeError::NoSuchPosition { path } => {
            UpdateError::Resolution(ResolutionError::PathNotFound { path })
        }
        other => UpdateError::Resolution(ResolutionError::Type(other)),
    })?;
    if declared.is_phantom() {
        return Err(UpdateError::PhantomTarget {
            path: path.to_string(),
        });
    }
    let listing_member = path
        .parent()
        .and_then(|p| schema.type_at(&p).ok())
        .is_some_and(|t| matches!(t, TypeRef::Listing(_)));
    if let Some(value) = update.value() {
        check_value(schema, &declared, path, value, listing_member)?;
    }
    if let Some((precondition, expected)) = update.precondition() {
        check_precondition(policy, root, precondition, expected)?;
    }

    let existing = entry_at(root, path)?;
    match update {
        Update::Replace { value, .. } | Update::ConditionalReplace { value, .. } => {
            if existing
                .as_ref()
                .is_some_and(|e| same_entry(e, value, listing_member))
            {
                return Ok(Applied::Unchanged);
            }
            write(schema, root, path, Some(value)).map(Applied::Changed)
        }
        Update::Create { value, .. } => {
            if existing.is_some() {
                return Err(UpdateError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            write(schema, root, path, Some(value)).map(Applied::Changed)
        }
        Update::ConditionalCreate { value, .. } => match existing {
            Some(current) if current == *value || same_entry(&current, value, listing_member) => {
                Ok(Applied::Unchanged)
            }
            Some(_) => Err(UpdateError::CreationConflict {
                path: path.to_string(),
            }),
            None => write(schema, root, path, Some(value)).map(Applied::Changed),
        },
        Update::Delete { .. } | Update::ConditionalDelete { .. } => {
            if path.is_root() {
                return Err(UpdateError::NotDeletable {
                    path: path.to_string(),
                    reason: "the root cannot be deleted".into(),
                });
            }
            if existing.is_none() {
                return Ok(Applied::Unchanged);
            }
            write(schema, root, path, None).map(Applied::Changed)
        }
    }
}

fn check_value(
    schema: &Schema,
    declared: &TypeRef,
    path: &Path,
    value: &Node,
    listing_member: bool,
) -> Result<()> {
    // Listing members are written as the entity they name, or just its id.
    if listing_member {
        return match value {
            Node::Id(_) => Ok(()),
            other if schema.check(declared, other).is_ok() => Ok(()),
            other => Err(UpdateError::TypeMismatch {
                path: path.to_string(),
                reason: format!("expected {declared} or an identifier, found {}", other.kind()),
            }),
        };
    }
    schema
        .validate(declared, value)
        .map_err(|e| UpdateError::TypeMismatch {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

/// Returns `true` if writing `value` over `existing` changes nothing.
fn same_entry(existing: &Node, value: &Node, listing_member: bool) -> bool {
    if listing_member {
        let named = match value {
            Node::Id(id) => Some(id),
            other => other.entity_id(),
        };
        return matches!(existing, Node::Id(member) if Some(member) == named);
    }
    Node::same(existing, value)
}

fn check_precondition(
    policy: &PreconditionPolicy,
    root: &Node,
    precondition: &Reference,
    expected: &Node,
) -> Result<()> {
    let actual = match resolve(precondition, root) {
        Ok(actual) => actual,
        Err(ResolutionError::PathNotFound { .. }) => {
            return Err(UpdateError::PreconditionFailed {
                path: precondition.path().to_string(),
                reason: "no value is present".into(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    if policy.matches(expected, &actual) {
        Ok(())
    } else {
        Err(UpdateError::PreconditionFailed {
            path: precondition.path().to_string(),
            reason: format!("expected {expected:?}, found {actual:?}"),
        })
    }
}

/// The value stored directly at `path`, or `None` if its parent holds
/// nothing there. Fails if the parent itself cannot be reached.
///
/// A listing member is reported as its identifier.
pub fn entry_at(root: &Node, path: &Path) -> Result<Option<Node>> {
    let Some((last, parents)) = path.segments().split_last() else {
        return Ok(Some(root.clone()));
    };
    let mut current = root.clone();
    for (depth, segment) in parents.iter().enumerate() {
        current = child(&current, segment, path, depth)?.ok_or_else(|| not_found(path, depth))?;
    }
    match &current {
        Node::Listing(listing) => {
            let id = segment_id(last, path, parents.len())?;
            Ok(listing.contains(&id).then_some(Node::Id(id)))
        }
        node => child(node, last, path, parents.len()),
    }
}

/// Direct child lookup used while walking to a write target.
fn child(node: &Node, segment: &Segment, path: &Path, depth: usize) -> Result<Option<Node>> {
    let name = literal(segment, path)?;
    let found = match node {
        Node::Record(record) => record.field(name).cloned(),
        Node::Catalog(catalog) => catalog.get(&segment_id(segment, path, depth)?).cloned(),
        Node::SideTable(table) => table.get(&segment_id(segment, path, depth)?).cloned(),
        Node::Variant(variant) if variant.tag() == name => Some(variant.value().clone()),
        Node::Variant(_) => {
            return Err(UpdateError::UnsupportedTarget {
                path: path.truncated(depth + 1).to_string(),
                reason: "only the current case of a variant can be written".into(),
            })
        }
        Node::Listing(_) => {
            return Err(UpdateError::UnsupportedTarget {
                path: path.truncated(depth + 1).to_string(),
                reason: "cannot write through a listing; write the domain catalog instead".into(),
            })
        }
        _ => return Err(not_found(path, depth)),
    };
    Ok(found)
}

/// Rebuild the spine from `root` to `path`, storing `value` (or removing
/// the entry when `None`) at the end.
fn write(schema: &Schema, root: &Node, path: &Path, value: Option<&Node>) -> Result<Node> {
    match value {
        Some(value) if path.is_root() => Ok(value.clone()),
        _ => rebuild(schema, root, path, 0, value),
    }
}

fn rebuild(
    schema: &Schema,
    node: &Node,
    path: &Path,
    depth: usize,
    value: Option<&Node>,
) -> Result<Node> {
    let segment = &path.segments()[depth];
    let is_leaf = depth + 1 == path.len();
    let replacement = if is_leaf {
        value.cloned()
    } else {
        let next = child(node, segment, path, depth)?.ok_or_else(|| not_found(path, depth))?;
        Some(rebuild(schema, &next, path, depth + 1, value)?)
    };
    let at = path.truncated(depth + 1);
    let name = literal(segment, path)?;

    let rebuilt = match (node, replacement) {
        (Node::Record(record), Some(v)) => Node::from(record.with(name, v)),
        (Node::Record(record), None) => {
            if !schema.is_optional_field(&at) {
                return Err(UpdateError::NotDeletable {
                    path: at.to_string(),
                    reason: format!("{} is a mandatory field of {}", name, record.type_name()),
                });
            }
            Node::from(record.without(name))
        }
        (Node::Catalog(catalog), Some(v)) => {
            let id = segment_id(segment, path, depth)?;
            let next = catalog.with(id, v).map_err(|e| match e {
                TypeError::IdMismatch { key, found } => UpdateError::IdMismatch {
                    path: at.to_string(),
                    key,
                    found,
                },
                other => UpdateError::TypeMismatch {
                    path: at.to_string(),
                    reason: other.to_string(),
                },
            })?;
            Node::from(next)
        }
        (Node::Catalog(catalog), None) => {
            Node::from(catalog.without(&segment_id(segment, path, depth)?))
        }
        (Node::SideTable(table), Some(v)) => {
            Node::from(table.with(segment_id(segment, path, depth)?, v))
        }
        (Node::SideTable(table), None) => {
            Node::from(table.without(&segment_id(segment, path, depth)?))
        }
        (Node::Listing(listing), Some(v)) => {
            let id = segment_id(segment, path, depth)?;
            let named = match &v {
                Node::Id(found) => Some(found),
                other => other.entity_id(),
            };
            if let Some(found) = named.filter(|found| **found != id) {
                return Err(UpdateError::IdMismatch {
                    path: at.to_string(),
                    key: id.to_string(),
                    found: found.to_string(),
                });
            }
            Node::from(listing.with(id))
        }
        (Node::Listing(listing), None) => {
            Node::from(listing.without(&segment_id(segment, path, depth)?))
        }
        (Node::Variant(variant), Some(v)) if variant.tag() == name => {
            Node::from(variant.with_value(v))
        }
        (Node::Variant(_), Some(_)) => {
            return Err(UpdateError::UnsupportedTarget {
                path: at.to_string(),
                reason: "only the current case of a variant can be written".into(),
            })
        }
        (Node::Variant(_), None) => {
            return Err(UpdateError::NotDeletable {
                path: at.to_string(),
                reason: "variant cases cannot be deleted".into(),
            })
        }
        _ => return Err(not_found(path, depth)),
    };
    Ok(rebuilt)
}

fn literal<'a>(segment: &'a Segment, path: &Path) -> Result<&'a str> {
    segment.as_literal().ok_or_else(|| {
        UpdateError::Resolution(ResolutionError::UnboundParameter {
            path: path.to_string(),
            parameter: segment.as_param().unwrap_or_default().to_string(),
        })
    })
}

fn segment_id(segment: &Segment, path: &Path, depth: usize) -> Result<Identifier> {
    segment.to_identifier().ok_or_else(|| not_found(path, depth))
}

fn not_found(path: &Path, depth: usize) -> UpdateError {
    UpdateError::Resolution(ResolutionError::PathNotFound {
        path: path.truncated(depth + 1).to_string(),
    })
}
