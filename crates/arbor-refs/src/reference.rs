//! Typed references and parameter bindings.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arbor_types::{Identifier, Path, Schema, Segment, TypeError, TypeRef};
use serde::{Deserialize, Serialize};

use crate::error::{ResolutionError, Result};

/// A typed, resolvable path into the tree.
///
/// Two references are equal iff their paths and target types are equal.
///
/// # Examples
///
/// ```
/// use arbor_refs::Reference;
/// use arbor_types::{RecordShape, Schema, TypeRef};
///
/// let schema = Schema::new(TypeRef::named("Doc"))
///     .record("Doc", RecordShape::new().field("name", TypeRef::Text));
/// let name = Reference::parse(&schema, "/name").unwrap();
/// assert_eq!(name.target(), &TypeRef::Text);
/// assert!(Reference::parse(&schema, "/missing").is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    path: Path,
    target: TypeRef,
}

impl Reference {
    /// Pair a path with a target type without consulting a schema.
    pub fn new(path: Path, target: TypeRef) -> Self {
        Self { path, target }
    }

    /// The reference to the root of a tree described by `schema`.
    pub fn root(schema: &Schema) -> Self {
        Self::new(Path::root(), schema.root.clone())
    }

    /// Type `path` from the schema.
    pub fn from_path(schema: &Schema, path: Path) -> Result<Self> {
        let target = schema.type_at(&path).map_err(|e| match e {
            TypeError::NoSuchPosition { path } => ResolutionError::PathNotFound { path },
            other => ResolutionError::Type(other),
        })?;
        Ok(Self { path, target })
    }

    /// Parse the textual form of a path and type it from the schema.
    pub fn parse(schema: &Schema, text: &str) -> Result<Self> {
        Self::from_path(schema, Path::parse(text)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> &TypeRef {
        &self.target
    }

    /// Extend this reference by one segment.
    pub fn then(&self, schema: &Schema, segment: impl Into<Segment>) -> Result<Self> {
        Self::from_path(schema, self.path.child(segment))
    }

    /// The reference one level up, or `None` at the root.
    pub fn parent(&self, schema: &Schema) -> Option<Self> {
        let parent = self.path.parent()?;
        Self::from_path(schema, parent).ok()
    }

    /// The nearest strict ancestor whose static type is the record `type_name`.
    pub fn enclosing(&self, schema: &Schema, type_name: &str) -> Option<Self> {
        let mut current = self.parent(schema);
        while let Some(candidate) = current {
            if matches!(&candidate.target, TypeRef::Named(n) if n == type_name)
                && schema.record_shape(type_name).is_some()
            {
                return Some(candidate);
            }
            current = candidate.parent(schema);
        }
        None
    }

    /// Parameter names in order of appearance.
    pub fn parameters(&self) -> Vec<&str> {
        self.path.parameters()
    }

    pub fn is_concrete(&self) -> bool {
        self.path.is_concrete()
    }

    /// Substitute bound placeholders; unbound ones are kept.
    pub fn bind(&self, env: &BindingEnvironment) -> Self {
        Self {
            path: env.apply(&self.path),
            target: self.target.clone(),
        }
    }

    /// Fail with `UnboundParameter` if any placeholder remains.
    pub fn ensure_concrete(&self) -> Result<()> {
        match self.path.parameters().first() {
            None => Ok(()),
            Some(parameter) => Err(ResolutionError::UnboundParameter {
                path: self.path.to_string(),
                parameter: parameter.to_string(),
            }),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.target)
    }
}

/// Bindings from parameter names to concrete identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingEnvironment {
    bindings: BTreeMap<Arc<str>, Identifier>,
}

impl BindingEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding.
    pub fn with(mut self, name: impl AsRef<str>, id: Identifier) -> Self {
        self.insert(name, id);
        self
    }

    pub fn insert(&mut self, name: impl AsRef<str>, id: Identifier) {
        self.bindings.insert(Arc::from(name.as_ref()), id);
    }

    pub fn get(&self, name: &str) -> Option<&Identifier> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Identifier)> {
        self.bindings.iter().map(|(k, v)| (&**k, v))
    }

    /// Extract the bindings that make `template` match `concrete`.
    ///
    /// Only the positions both paths share are compared, so a scope can be
    /// matched against a changed path above or below it. Returns `None` if
    /// two literals differ or one parameter would need two values.
    ///
    /// # Examples
    ///
    /// ```
    /// use arbor_refs::BindingEnvironment;
    /// use arbor_types::Path;
    ///
    /// let template = Path::parse("/planets/-p-/moons/-m-").unwrap();
    /// let changed = Path::parse("/planets/earth").unwrap();
    /// let env = BindingEnvironment::from_instance(&template, &changed).unwrap();
    /// assert_eq!(env.get("p").unwrap().as_str(), "earth");
    /// assert!(env.get("m").is_none());
    /// ```
    pub fn from_instance(template: &Path, concrete: &Path) -> Option<Self> {
        let mut env = Self::new();
        for (t, c) in template.segments().iter().zip(concrete.segments()) {
            match (t, c) {
                (Segment::Literal(a), Segment::Literal(b)) => {
                    if a != b {
                        return None;
                    }
                }
                (Segment::Param(name), Segment::Literal(value)) => {
                    let id = Identifier::new(&**value).ok()?;
                    match env.get(name) {
                        Some(existing) if existing != &id => return None,
                        Some(_) => {}
                        None => env.insert(&**name, id),
                    }
                }
                (_, Segment::Param(_)) => {}
            }
        }
        Some(env)
    }

    /// Substitute every bound parameter of `path`.
    pub fn apply(&self, path: &Path) -> Path {
        Path::from_segments(path.segments().iter().map(|segment| match segment {
            Segment::Param(name) => match self.bindings.get(name) {
                Some(id) => Segment::from(id),
                None => segment.clone(),
            },
            literal => literal.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{RecordShape, VariantFamily};

    fn schema() -> Schema {
        Schema::new(TypeRef::named("System"))
            .record(
                "System",
                RecordShape::new()
                    .field("planets", TypeRef::catalog(TypeRef::named("Planet")))
                    .field("home", TypeRef::reference(TypeRef::named("Planet"))),
            )
            .record(
                "Planet",
                RecordShape::new()
                    .field("id", TypeRef::Identifier)
                    .field("moons", TypeRef::catalog(TypeRef::named("Moon")))
                    .field("climate", TypeRef::named("Climate")),
            )
            .record(
                "Moon",
                RecordShape::new()
                    .field("id", TypeRef::Identifier)
                    .field("radius", TypeRef::Int),
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

    // ---- Test 1: references are typed from the schema ----
    #[test]
    fn typed_from_schema() {
        let s = schema();
        let r = Reference::parse(&s, "/planets/-p-/moons/-m-/radius").unwrap();
        assert_eq!(r.target(), &TypeRef::Int);
        assert_eq!(r.parameters(), vec!["p", "m"]);
        assert!(!r.is_concrete());

        let missing = Reference::parse(&s, "/planets/earth/rings");
        assert!(matches!(
            missing,
            Err(ResolutionError::PathNotFound { .. })
        ));
        assert!(matches!(
            Reference::parse(&s, "planets"),
            Err(ResolutionError::Type(_))
        ));
    }

    // ---- Test 2: then / parent / enclosing ----
    #[test]
    fn navigation() {
        let s = schema();
        let planets = Reference::parse(&s, "/planets").unwrap();
        let earth = planets.then(&s, id("earth")).unwrap();
        assert_eq!(earth.target(), &TypeRef::named("Planet"));
        assert_eq!(earth.parent(&s).unwrap(), planets);
        assert!(Reference::root(&s).parent(&s).is_none());

        let radius = Reference::parse(&s, "/planets/earth/moons/luna/radius").unwrap();
        let planet = radius.enclosing(&s, "Planet").unwrap();
        assert_eq!(planet.path().to_string(), "/planets/earth");
        let system = radius.enclosing(&s, "System").unwrap();
        assert!(system.path().is_root());
        assert!(radius.enclosing(&s, "Climate").is_none());
    }

    // ---- Test 3: binding keeps unbound placeholders ----
    #[test]
    fn bind_partial() {
        let s = schema();
        let r = Reference::parse(&s, "/planets/-p-/moons/-m-").unwrap();
        let env = BindingEnvironment::new().with("p", id("earth"));
        let bound = r.bind(&env);
        assert_eq!(bound.path().to_string(), "/planets/earth/moons/-m-");
        assert_eq!(bound.target(), r.target());
        assert!(matches!(
            bound.ensure_concrete(),
            Err(ResolutionError::UnboundParameter { parameter, .. }) if parameter == "m"
        ));
        let full = bound.bind(&BindingEnvironment::new().with("m", id("luna")));
        assert!(full.ensure_concrete().is_ok());
    }

    // ---- Test 4: bindings extracted from an instance path ----
    #[test]
    fn from_instance_rules() {
        let t = Path::parse("/planets/-p-/moons/-m-").unwrap();
        let deep = Path::parse("/planets/earth/moons/luna/radius").unwrap();
        let env = BindingEnvironment::from_instance(&t, &deep).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env.apply(&t).to_string(), "/planets/earth/moons/luna");

        let other = Path::parse("/home").unwrap();
        assert!(BindingEnvironment::from_instance(&t, &other).is_none());

        let twice = Path::parse("/a/-x-/b/-x-").unwrap();
        let conflicting = Path::parse("/a/one/b/two").unwrap();
        assert!(BindingEnvironment::from_instance(&twice, &conflicting).is_none());
    }

    // ---- Test 5: equality covers path and target ----
    #[test]
    fn equality() {
        let p = Path::parse("/x").unwrap();
        assert_eq!(
            Reference::new(p.clone(), TypeRef::Int),
            Reference::new(p.clone(), TypeRef::Int)
        );
        assert_ne!(
            Reference::new(p.clone(), TypeRef::Int),
            Reference::new(p, TypeRef::Text)
        );
    }

    // ---- Test 6: references serialize as path and target text ----
    #[test]
    fn serde_shape() {
        let r = Reference::new(Path::parse("/planets/-p-").unwrap(), TypeRef::named("Planet"));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["path"], "/planets/-p-");
        assert_eq!(json["target"], "Planet");
        let back: Reference = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
