//! Immutable tree values.
//!
//! A [`Node`] is either a scalar or a container. Containers sit behind an
//! `Arc`, so cloning a node never copies a subtree. "Mutation" always means
//! building a new container that shares every untouched child with the old
//! one; see `arbor_tree::update` for the copy-on-write walk.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::identifier::Identifier;
use crate::path::Path;

/// Name of the record field that makes a record an entity.
pub const ID_FIELD: &str = "id";

/// Runtime kind of a [`Node`], used for type checks and per-kind policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Bool,
    Int,
    Float,
    Text,
    Id,
    Ref,
    Record,
    Catalog,
    Listing,
    SideTable,
    Variant,
}

impl NodeKind {
    /// Returns `true` for kinds without children.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            NodeKind::Bool | NodeKind::Int | NodeKind::Float | NodeKind::Text | NodeKind::Id | NodeKind::Ref
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Bool => "bool",
            NodeKind::Int => "int",
            NodeKind::Float => "float",
            NodeKind::Text => "text",
            NodeKind::Id => "identifier",
            NodeKind::Ref => "reference",
            NodeKind::Record => "record",
            NodeKind::Catalog => "catalog",
            NodeKind::Listing => "listing",
            NodeKind::SideTable => "side_table",
            NodeKind::Variant => "variant",
        };
        f.write_str(s)
    }
}

/// An immutable value in the state tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(Arc<str>),
    Id(Identifier),
    /// A stored reference, resolved lazily against whatever snapshot reads it.
    Ref(Path),
    Record(Arc<Record>),
    Catalog(Arc<Catalog>),
    Listing(Arc<Listing>),
    SideTable(Arc<SideTable>),
    Variant(Arc<Variant>),
}

impl Node {
    pub fn text(value: impl AsRef<str>) -> Self {
        Node::Text(Arc::from(value.as_ref()))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Bool(_) => NodeKind::Bool,
            Node::Int(_) => NodeKind::Int,
            Node::Float(_) => NodeKind::Float,
            Node::Text(_) => NodeKind::Text,
            Node::Id(_) => NodeKind::Id,
            Node::Ref(_) => NodeKind::Ref,
            Node::Record(_) => NodeKind::Record,
            Node::Catalog(_) => NodeKind::Catalog,
            Node::Listing(_) => NodeKind::Listing,
            Node::SideTable(_) => NodeKind::SideTable,
            Node::Variant(_) => NodeKind::Variant,
        }
    }

    /// Pointer identity for containers, value equality for scalars.
    ///
    /// Two snapshots that share a subtree return `true` here for it, which is
    /// how structural sharing is observed.
    pub fn same(a: &Node, b: &Node) -> bool {
        match (a, b) {
            (Node::Text(x), Node::Text(y)) => Arc::ptr_eq(x, y) || x == y,
            (Node::Record(x), Node::Record(y)) => Arc::ptr_eq(x, y),
            (Node::Catalog(x), Node::Catalog(y)) => Arc::ptr_eq(x, y),
            (Node::Listing(x), Node::Listing(y)) => Arc::ptr_eq(x, y),
            (Node::SideTable(x), Node::SideTable(y)) => Arc::ptr_eq(x, y),
            (Node::Variant(x), Node::Variant(y)) => Arc::ptr_eq(x, y),
            _ => a.kind().is_scalar() && a == b,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Node::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Node::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Node::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_catalog(&self) -> Option<&Catalog> {
        match self {
            Node::Catalog(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_listing(&self) -> Option<&Listing> {
        match self {
            Node::Listing(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_side_table(&self) -> Option<&SideTable> {
        match self {
            Node::SideTable(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Node::Variant(v) => Some(v),
            _ => None,
        }
    }

    /// The `id` of an entity record, if this node is one.
    pub fn entity_id(&self) -> Option<&Identifier> {
        self.as_record().and_then(Record::id)
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::Bool(b)
    }
}

impl From<i64> for Node {
    fn from(i: i64) -> Self {
        Node::Int(i)
    }
}

impl From<f64> for Node {
    fn from(f: f64) -> Self {
        Node::Float(f)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::text(s)
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::Text(Arc::from(s))
    }
}

impl From<Identifier> for Node {
    fn from(id: Identifier) -> Self {
        Node::Id(id)
    }
}

impl From<Record> for Node {
    fn from(r: Record) -> Self {
        Node::Record(Arc::new(r))
    }
}

impl From<Catalog> for Node {
    fn from(c: Catalog) -> Self {
        Node::Catalog(Arc::new(c))
    }
}

impl From<Listing> for Node {
    fn from(l: Listing) -> Self {
        Node::Listing(Arc::new(l))
    }
}

impl From<SideTable> for Node {
    fn from(t: SideTable) -> Self {
        Node::SideTable(Arc::new(t))
    }
}

impl From<Variant> for Node {
    fn from(v: Variant) -> Self {
        Node::Variant(Arc::new(v))
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A fixed-shape record: a named type with ordered fields.
///
/// Optional fields that hold no value are simply absent. A record with an
/// `id` field of kind identifier is an entity and may live in a [`Catalog`].
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    type_name: Arc<str>,
    fields: IndexMap<Arc<str>, Node>,
}

impl Record {
    pub fn new(type_name: impl AsRef<str>) -> Self {
        Self {
            type_name: Arc::from(type_name.as_ref()),
            fields: IndexMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl AsRef<str>, value: impl Into<Node>) -> Self {
        self.fields.insert(Arc::from(name.as_ref()), value.into());
        self
    }

    /// An entity record of `type_name` carrying `id`.
    pub fn entity(type_name: impl AsRef<str>, id: Identifier) -> Self {
        Self::new(type_name).with_field(ID_FIELD, Node::Id(id))
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn field(&self, name: &str) -> Option<&Node> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.fields.iter().map(|(k, v)| (&**k, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn id(&self) -> Option<&Identifier> {
        match self.fields.get(ID_FIELD) {
            Some(Node::Id(id)) => Some(id),
            _ => None,
        }
    }

    /// A copy with `name` set to `value`; other fields are shared.
    pub fn with(&self, name: &str, value: Node) -> Self {
        let mut next = self.clone();
        if let Some(slot) = next.fields.get_mut(name) {
            *slot = value;
        } else {
            next.fields.insert(Arc::from(name), value);
        }
        next
    }

    /// A copy without `name`.
    pub fn without(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.fields.shift_remove(name);
        next
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Ordered, insertion-order-preserving map from [`Identifier`] to entity.
///
/// Invariant: every entry is an entity record whose `id` equals its key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    entries: IndexMap<Identifier, Node>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from entities, keyed by their own ids.
    pub fn from_entities(entities: impl IntoIterator<Item = Node>) -> Result<Self, TypeError> {
        let mut catalog = Self::new();
        for entity in entities {
            let id = entity
                .entity_id()
                .cloned()
                .ok_or_else(|| TypeError::SchemaViolation {
                    path: "catalog".into(),
                    reason: format!("catalog entries must be entities, found {}", entity.kind()),
                })?;
            if catalog.entries.contains_key(&id) {
                return Err(TypeError::SchemaViolation {
                    path: "catalog".into(),
                    reason: format!("duplicate identifier {id}"),
                });
            }
            catalog.entries.insert(id, entity);
        }
        Ok(catalog)
    }

    pub fn get(&self, id: &Identifier) -> Option<&Node> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Identifier> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &Node)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy with `entity` stored under `id`.
    ///
    /// An existing key keeps its position; a new key is appended.
    pub fn with(&self, id: Identifier, entity: Node) -> Result<Self, TypeError> {
        match entity.entity_id() {
            Some(found) if *found == id => {}
            Some(found) => {
                return Err(TypeError::IdMismatch {
                    key: id.to_string(),
                    found: found.to_string(),
                })
            }
            None => {
                return Err(TypeError::SchemaViolation {
                    path: id.to_string(),
                    reason: format!("catalog entries must be entities, found {}", entity.kind()),
                })
            }
        }
        let mut next = self.clone();
        next.entries.insert(id, entity);
        Ok(next)
    }

    /// A copy without `id`; the order of the remaining entries is kept.
    pub fn without(&self, id: &Identifier) -> Self {
        let mut next = self.clone();
        next.entries.shift_remove(id);
        next
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Ordered set of identifiers that refer into a domain [`Catalog`].
///
/// Entries are not checked against the domain when written; a dangling entry
/// surfaces as `PathNotFound` when it is resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Listing {
    domain: Path,
    ids: IndexSet<Identifier>,
}

impl Listing {
    pub fn new(domain: Path) -> Self {
        Self {
            domain,
            ids: IndexSet::new(),
        }
    }

    pub fn with_ids(domain: Path, ids: impl IntoIterator<Item = Identifier>) -> Self {
        Self {
            domain,
            ids: ids.into_iter().collect(),
        }
    }

    /// Path of the catalog this listing refers into.
    pub fn domain(&self) -> &Path {
        &self.domain
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Identifier> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn with(&self, id: Identifier) -> Self {
        let mut next = self.clone();
        next.ids.insert(id);
        next
    }

    pub fn without(&self, id: &Identifier) -> Self {
        let mut next = self.clone();
        next.ids.shift_remove(id);
        next
    }
}

// ---------------------------------------------------------------------------
// SideTable
// ---------------------------------------------------------------------------

/// Map from identifiers of a domain [`Catalog`] to arbitrary values.
#[derive(Clone, Debug, PartialEq)]
pub struct SideTable {
    domain: Path,
    entries: IndexMap<Identifier, Node>,
}

impl SideTable {
    pub fn new(domain: Path) -> Self {
        Self {
            domain,
            entries: IndexMap::new(),
        }
    }

    pub fn domain(&self) -> &Path {
        &self.domain
    }

    pub fn get(&self, id: &Identifier) -> Option<&Node> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Identifier> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &Node)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with(&self, id: Identifier, value: Node) -> Self {
        let mut next = self.clone();
        next.entries.insert(id, value);
        next
    }

    pub fn without(&self, id: &Identifier) -> Self {
        let mut next = self.clone();
        next.entries.shift_remove(id);
        next
    }
}

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

/// A member of a tagged-union family: one case tag plus that case's value.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    family: Arc<str>,
    tag: Arc<str>,
    value: Node,
}

impl Variant {
    pub fn new(family: impl AsRef<str>, tag: impl AsRef<str>, value: impl Into<Node>) -> Self {
        Self {
            family: Arc::from(family.as_ref()),
            tag: Arc::from(tag.as_ref()),
            value: value.into(),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn value(&self) -> &Node {
        &self.value
    }

    /// A copy of this case carrying `value`.
    pub fn with_value(&self, value: Node) -> Self {
        Self {
            family: self.family.clone(),
            tag: self.tag.clone(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identifier {
        Identifier::new(s).unwrap()
    }

    fn planet(name: &str) -> Node {
        Record::entity("Planet", id(name))
            .with_field("name", name)
            .into()
    }

    #[test]
    fn catalog_preserves_insertion_order() {
        let c = Catalog::from_entities(vec![planet("b"), planet("a"), planet("c")]).unwrap();
        let ids: Vec<_> = c.ids().map(|i| i.as_str().to_string()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        // Replacing an existing entry keeps its position.
        let updated = c.with(id("a"), planet("a")).unwrap();
        let ids: Vec<_> = updated.ids().map(|i| i.as_str().to_string()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        // Removing keeps the order of the rest.
        let removed = updated.without(&id("b"));
        let ids: Vec<_> = removed.ids().map(|i| i.as_str().to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn catalog_rejects_mismatched_id() {
        let c = Catalog::new();
        let err = c.with(id("earth"), planet("mars")).unwrap_err();
        assert!(matches!(err, TypeError::IdMismatch { .. }));
    }

    #[test]
    fn catalog_rejects_duplicates_and_non_entities() {
        assert!(Catalog::from_entities(vec![planet("a"), planet("a")]).is_err());
        assert!(Catalog::from_entities(vec![Node::Int(3)]).is_err());
    }

    #[test]
    fn same_detects_shared_subtrees() {
        let a = planet("earth");
        let b = a.clone();
        let c = planet("earth");
        assert!(Node::same(&a, &b));
        assert!(!Node::same(&a, &c));
        assert_eq!(a, c);
        assert!(Node::same(&Node::Int(1), &Node::Int(1)));
    }

    #[test]
    fn record_copy_on_write_shares_untouched_fields() {
        let moons: Node = Catalog::new().into();
        let r = Record::new("Planet").with_field("moons", moons.clone());
        let r2 = r.with("name", Node::text("x"));
        assert!(Node::same(r2.field("moons").unwrap(), &moons));
        assert!(r.field("name").is_none());
    }

    #[test]
    fn listing_and_side_table_basics() {
        let domain = Path::parse("/planets").unwrap();
        let l = Listing::new(domain.clone()).with(id("a")).with(id("b"));
        assert!(l.contains(&id("a")));
        assert_eq!(l.without(&id("a")).len(), 1);

        let t = SideTable::new(domain).with(id("a"), Node::Int(1));
        assert_eq!(t.get(&id("a")), Some(&Node::Int(1)));
        assert!(t.without(&id("a")).is_empty());
    }
}
