//! The reference resolver.
//!
//! Segment semantics by container:
//! - Record: the segment names a field
//! - Catalog / SideTable: the segment is an entry id
//! - Listing: the id must be a member; the entity is read from the
//!   listing's domain catalog, resolved against the same root
//! - Variant: the segment must be the current case tag

use arbor_types::{Identifier, Node, Path, Segment, TypeRef};

use crate::error::{ResolutionError, Result};
use crate::reference::Reference;

/// Resolve `reference` against `root`.
///
/// # Examples
///
/// ```
/// use arbor_refs::{resolve, Reference};
/// use arbor_types::{Node, Record, RecordShape, Schema, TypeRef};
///
/// let schema = Schema::new(TypeRef::named("Doc"))
///     .record("Doc", RecordShape::new().field("name", TypeRef::Text));
/// let root: Node = Record::new("Doc").with_field("name", "Alice").into();
/// let name = Reference::parse(&schema, "/name").unwrap();
/// assert_eq!(resolve(&name, &root).unwrap(), Node::text("Alice"));
/// ```
pub fn resolve(reference: &Reference, root: &Node) -> Result<Node> {
    reference.ensure_concrete()?;
    let node = resolve_path(root, reference.path())?;
    if !conforms(reference.target(), &node) {
        return Err(ResolutionError::TypeMismatch {
            path: reference.path().to_string(),
            expected: reference.target().to_string(),
            found: node.kind().to_string(),
        });
    }
    Ok(node)
}

/// Untyped walk of `path` from `root`.
pub fn resolve_path(root: &Node, path: &Path) -> Result<Node> {
    let mut current = root.clone();
    for (depth, segment) in path.segments().iter().enumerate() {
        let not_found = || ResolutionError::PathNotFound {
            path: path.truncated(depth + 1).to_string(),
        };
        let name = match segment {
            Segment::Literal(name) => name,
            Segment::Param(parameter) => {
                return Err(ResolutionError::UnboundParameter {
                    path: path.to_string(),
                    parameter: parameter.to_string(),
                })
            }
        };
        let next = match &current {
            Node::Record(record) => record.field(name).cloned(),
            Node::Catalog(catalog) => entry_id(name).and_then(|id| catalog.get(&id).cloned()),
            Node::SideTable(table) => entry_id(name).and_then(|id| table.get(&id).cloned()),
            Node::Listing(listing) => match entry_id(name) {
                Some(id) if listing.contains(&id) => {
                    let domain = resolve_path(root, listing.domain())?;
                    domain.as_catalog().and_then(|c| c.get(&id).cloned())
                }
                _ => None,
            },
            Node::Variant(variant) if variant.tag() == &**name => Some(variant.value().clone()),
            _ => None,
        };
        current = next.ok_or_else(not_found)?;
    }
    Ok(current)
}

/// Follow a stored [`Node::Ref`]; any other node is returned as-is.
pub fn dereference(root: &Node, node: &Node) -> Result<Node> {
    match node {
        Node::Ref(path) => resolve_path(root, path),
        other => Ok(other.clone()),
    }
}

/// Returns `true` if the runtime kind of `node` is compatible with `ty`.
///
/// Named types are matched by record type name or variant family.
pub fn conforms(ty: &TypeRef, node: &Node) -> bool {
    match (ty, node) {
        (TypeRef::Bool, Node::Bool(_))
        | (TypeRef::Int, Node::Int(_))
        | (TypeRef::Float, Node::Float(_))
        | (TypeRef::Text, Node::Text(_))
        | (TypeRef::Identifier, Node::Id(_))
        | (TypeRef::Reference(_), Node::Ref(_))
        | (TypeRef::Catalog(_), Node::Catalog(_))
        | (TypeRef::Listing(_), Node::Listing(_))
        | (TypeRef::SideTable(_, _), Node::SideTable(_)) => true,
        (TypeRef::Named(name), Node::Record(r)) => r.type_name() == name,
        (TypeRef::Named(name), Node::Variant(v)) => v.family() == name,
        _ => false,
    }
}

fn entry_id(name: &str) -> Option<Identifier> {
    Identifier::new(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{Catalog, Listing, Record, RecordShape, Schema, SideTable, Variant, VariantFamily};

    fn schema() -> Schema {
        Schema::new(TypeRef::named("System"))
            .record(
                "System",
                RecordShape::new()
                    .field("planets", TypeRef::catalog(TypeRef::named("Planet")))
                    .field("favourites", TypeRef::listing(TypeRef::named("Planet")))
                    .field(
                        "population",
                        TypeRef::side_table(TypeRef::named("Planet"), TypeRef::Int),
                    )
                    .field("home", TypeRef::reference(TypeRef::named("Planet"))),
            )
            .record(
                "Planet",
                RecordShape::new()
                    .field("id", TypeRef::Identifier)
                    .field("name", TypeRef::Text)
                    .field("climate", TypeRef::named("Climate")),
            )
            .variant(
                "Climate",
                VariantFamily::new()
                    .case("arid", TypeRef::Int)
                    .case("wet", TypeRef::Text),
            )
    }

    fn id(s: &str) -> Identifier {
        Identifier::new(s).unwrap()
    }

    fn planet(key: &str, name: &str) -> Node {
        Record::entity("Planet", id(key))
            .with_field("name", name)
            .with_field("climate", Variant::new("Climate", "arid", 3i64))
            .into()
    }

    fn root() -> Node {
        let planets_path = Path::parse("/planets").unwrap();
        Record::new("System")
            .with_field(
                "planets",
                Catalog::from_entities(vec![planet("earth", "Earth"), planet("mars", "Mars")])
                    .unwrap(),
            )
            .with_field(
                "favourites",
                Listing::with_ids(planets_path.clone(), vec![id("mars"), id("pluto")]),
            )
            .with_field(
                "population",
                SideTable::new(planets_path).with(id("earth"), 8i64.into()),
            )
            .with_field("home", Node::Ref(Path::parse("/planets/earth").unwrap()))
            .into()
    }

    fn r(path: &str) -> Reference {
        Reference::parse(&schema(), path).unwrap()
    }

    // ---- Test 1: fields, catalogs and side tables ----
    #[test]
    fn resolves_containers() {
        let root = root();
        assert_eq!(
            resolve(&r("/planets/mars/name"), &root).unwrap(),
            Node::text("Mars")
        );
        assert_eq!(
            resolve(&r("/population/earth"), &root).unwrap(),
            Node::Int(8)
        );
        assert!(matches!(
            resolve(&r("/population/mars"), &root),
            Err(ResolutionError::PathNotFound { .. })
        ));
    }

    // ---- Test 2: listings dereference through the domain ----
    #[test]
    fn listing_members_and_dangling_entries() {
        let root = root();
        let mars = resolve(&r("/favourites/mars/name"), &root).unwrap();
        assert_eq!(mars, Node::text("Mars"));
        // earth exists in the catalog but is not a member
        assert!(resolve(&r("/favourites/earth"), &root).is_err());
        // pluto is a member but dangling
        assert!(matches!(
            resolve(&r("/favourites/pluto"), &root),
            Err(ResolutionError::PathNotFound { path }) if path == "/favourites/pluto"
        ));
    }

    // ---- Test 3: variants match only the current case ----
    #[test]
    fn variant_cases() {
        let root = root();
        assert_eq!(
            resolve(&r("/planets/earth/climate/arid"), &root).unwrap(),
            Node::Int(3)
        );
        assert!(resolve(&r("/planets/earth/climate/wet"), &root).is_err());
    }

    // ---- Test 4: parameters and type mismatches ----
    #[test]
    fn unbound_and_mismatch() {
        let root = root();
        assert!(matches!(
            resolve(&r("/planets/-p-/name"), &root),
            Err(ResolutionError::UnboundParameter { .. })
        ));
        let wrong = Reference::new(Path::parse("/planets/earth/name").unwrap(), TypeRef::Int);
        assert!(matches!(
            resolve(&wrong, &root),
            Err(ResolutionError::TypeMismatch { .. })
        ));
    }

    // ---- Test 5: stored references resolve lazily ----
    #[test]
    fn stored_reference() {
        let root = root();
        let home = resolve(&r("/home"), &root).unwrap();
        let target = dereference(&root, &home).unwrap();
        assert_eq!(target.as_record().unwrap().id(), Some(&id("earth")));
    }

    // ---- Test 6: resolution is a pure function of its inputs ----
    #[test]
    fn resolution_is_pure() {
        let root = root();
        let reference = r("/planets/earth");
        let a = resolve(&reference, &root).unwrap();
        let b = resolve(&reference, &root).unwrap();
        assert!(Node::same(&a, &b));
    }
}
