use std::collections::BTreeMap;

use arbor_types::{Node, NodeKind};
use serde::{Deserialize, Serialize};

/// How two values are compared when checking a precondition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqualityMode {
    /// Scalars by value, entities by `id`, variants by case tag, and
    /// containers by their ordered key list.
    #[default]
    Identity,
    /// Deep equality of the whole subtree.
    Structural,
}

/// Per-kind equality rules for conditional replace and delete.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionPolicy {
    /// Mode used for kinds without an override.
    #[serde(default)]
    pub default: EqualityMode,
    /// Kind-specific overrides.
    #[serde(default)]
    pub overrides: BTreeMap<NodeKind, EqualityMode>,
}

impl PreconditionPolicy {
    /// Deep equality for every kind.
    pub fn structural() -> Self {
        Self {
            default: EqualityMode::Structural,
            ..Default::default()
        }
    }

    /// Builder-style override for one kind.
    pub fn with_mode(mut self, kind: NodeKind, mode: EqualityMode) -> Self {
        self.overrides.insert(kind, mode);
        self
    }

    pub fn mode_for(&self, kind: NodeKind) -> EqualityMode {
        self.overrides.get(&kind).copied().unwrap_or(self.default)
    }

    /// Returns `true` if `actual` satisfies a precondition expecting `expected`.
    ///
    /// # Examples
    ///
    /// ```
    /// use arbor_tree::{EqualityMode, PreconditionPolicy};
    /// use arbor_types::{Identifier, Node, NodeKind, Record};
    ///
    /// let id = Identifier::new("earth").unwrap();
    /// let a: Node = Record::entity("Planet", id.clone()).with_field("mass", 1i64).into();
    /// let b: Node = Record::entity("Planet", id).with_field("mass", 2i64).into();
    ///
    /// assert!(PreconditionPolicy::default().matches(&a, &b));
    /// let strict = PreconditionPolicy::default().with_mode(NodeKind::Record, EqualityMode::Structural);
    /// assert!(!strict.matches(&a, &b));
    /// ```
    pub fn matches(&self, expected: &Node, actual: &Node) -> bool {
        if expected.kind() != actual.kind() {
            return false;
        }
        if Node::same(expected, actual) {
            return true;
        }
        match self.mode_for(expected.kind()) {
            EqualityMode::Structural => expected == actual,
            EqualityMode::Identity => identity_eq(expected, actual),
        }
    }
}

fn identity_eq(expected: &Node, actual: &Node) -> bool {
    match (expected, actual) {
        (Node::Record(a), Node::Record(b)) => match (a.id(), b.id()) {
            (Some(x), Some(y)) => a.type_name() == b.type_name() && x == y,
            _ => a == b,
        },
        (Node::Variant(a), Node::Variant(b)) => a.family() == b.family() && a.tag() == b.tag(),
        (Node::Catalog(a), Node::Catalog(b)) => a.ids().eq(b.ids()),
        (Node::Listing(a), Node::Listing(b)) => a.domain() == b.domain() && a.ids().eq(b.ids()),
        (Node::SideTable(a), Node::SideTable(b)) => a.ids().eq(b.ids()),
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{Catalog, Identifier, Record, Variant};

    fn planet(id: &str, mass: i64) -> Node {
        Record::entity("Planet", Identifier::new(id).unwrap())
            .with_field("mass", mass)
            .into()
    }

    #[test]
    fn scalars_compare_by_value() {
        let policy = PreconditionPolicy::default();
        assert!(policy.matches(&Node::Int(0), &Node::Int(0)));
        assert!(!policy.matches(&Node::Int(0), &Node::Int(1)));
        assert!(!policy.matches(&Node::Int(0), &Node::text("0")));
    }

    #[test]
    fn identity_mode_ignores_entity_contents() {
        let policy = PreconditionPolicy::default();
        assert!(policy.matches(&planet("earth", 1), &planet("earth", 5)));
        assert!(!policy.matches(&planet("earth", 1), &planet("mars", 1)));

        let a = Node::from(Variant::new("Climate", "arid", 1i64));
        let b = Node::from(Variant::new("Climate", "arid", 9i64));
        let c = Node::from(Variant::new("Climate", "wet", 1i64));
        assert!(policy.matches(&a, &b));
        assert!(!policy.matches(&a, &c));
    }

    #[test]
    fn catalogs_compare_key_lists_in_order() {
        let policy = PreconditionPolicy::default();
        let ab = Node::from(Catalog::from_entities(vec![planet("a", 1), planet("b", 1)]).unwrap());
        let ab2 = Node::from(Catalog::from_entities(vec![planet("a", 7), planet("b", 7)]).unwrap());
        let ba = Node::from(Catalog::from_entities(vec![planet("b", 1), planet("a", 1)]).unwrap());
        assert!(policy.matches(&ab, &ab2));
        assert!(!policy.matches(&ab, &ba));
        assert!(!PreconditionPolicy::structural().matches(&ab, &ab2));
    }

    #[test]
    fn policy_loads_from_toml() {
        let text = r#"
            default = "identity"
            [overrides]
            record = "structural"
        "#;
        let policy: PreconditionPolicy = toml::from_str(text).unwrap();
        assert_eq!(policy.mode_for(NodeKind::Record), EqualityMode::Structural);
        assert_eq!(policy.mode_for(NodeKind::Catalog), EqualityMode::Identity);
    }
}
