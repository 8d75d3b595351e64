//! Declarative type-descriptor registry.
//!
//! The shape of a tree is declared once, up front, as a [`Schema`]: a root
//! [`TypeRef`] plus a table of named record shapes and variant families.
//! Nothing is discovered by introspection; the codec and the update
//! algorithm both consume this registry.
//!
//! Type expressions have a compact textual form that is used in TOML:
//!
//! ```text
//! Bool | Int | Float | Text | Identifier
//! Reference<T> | Catalog<T> | Listing<T> | SideTable<K, V> | Phantom<T>
//! Planet            (any other name refers to a registered type)
//! ```

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::node::{Node, ID_FIELD};
use crate::path::{Path, Segment};

// ---------------------------------------------------------------------------
// TypeRef
// ---------------------------------------------------------------------------

/// A static type: a builtin or a reference to a registered [`TypeDef`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeRef {
    Bool,
    Int,
    Float,
    Text,
    Identifier,
    Reference(Box<TypeRef>),
    Catalog(Box<TypeRef>),
    Listing(Box<TypeRef>),
    SideTable(Box<TypeRef>, Box<TypeRef>),
    /// Reserves a position for a value that is never present.
    Phantom(Box<TypeRef>),
    Named(String),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn catalog(element: TypeRef) -> Self {
        TypeRef::Catalog(Box::new(element))
    }

    pub fn listing(element: TypeRef) -> Self {
        TypeRef::Listing(Box::new(element))
    }

    pub fn side_table(key: TypeRef, value: TypeRef) -> Self {
        TypeRef::SideTable(Box::new(key), Box::new(value))
    }

    pub fn reference(target: TypeRef) -> Self {
        TypeRef::Reference(Box::new(target))
    }

    pub fn phantom(inner: TypeRef) -> Self {
        TypeRef::Phantom(Box::new(inner))
    }

    /// Parse a type expression such as `SideTable<Planet, Int>`.
    pub fn parse(expr: &str) -> Result<Self, TypeError> {
        let mut parser = TypeParser {
            src: expr,
            pos: 0,
        };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != expr.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(ty)
    }

    pub fn is_phantom(&self) -> bool {
        matches!(self, TypeRef::Phantom(_))
    }
}

struct TypeParser<'a> {
    src: &'a str,
    pos: usize,
}

impl TypeParser<'_> {
    fn error(&self, reason: &str) -> TypeError {
        TypeError::InvalidTypeExpr {
            expr: self.src.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.src[self.pos..].chars().next().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, ch: char) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<&str, TypeError> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.src[self.pos..].chars().next() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected a type name"));
        }
        Ok(&self.src[start..self.pos])
    }

    fn parse_type(&mut self) -> Result<TypeRef, TypeError> {
        let name = self.ident()?.to_string();
        let mut args = Vec::new();
        if self.eat('<') {
            loop {
                args.push(self.parse_type()?);
                if self.eat(',') {
                    continue;
                }
                if self.eat('>') {
                    break;
                }
                return Err(self.error("expected ',' or '>'"));
            }
        }
        let expected = match name.as_str() {
            "Bool" | "Int" | "Float" | "Text" | "Identifier" => 0,
            "Reference" | "Catalog" | "Listing" | "Phantom" => 1,
            "SideTable" => 2,
            _ => 0,
        };
        if args.len() != expected {
            return Err(self.error(&format!("{name} takes {expected} type argument(s)")));
        }
        let mut args = args.into_iter().map(Box::new);
        let mut arg = || args.next().ok_or_else(|| self.error("missing type argument"));
        let ty = match name.as_str() {
            "Bool" => TypeRef::Bool,
            "Int" => TypeRef::Int,
            "Float" => TypeRef::Float,
            "Text" => TypeRef::Text,
            "Identifier" => TypeRef::Identifier,
            "Reference" => TypeRef::Reference(arg()?),
            "Catalog" => TypeRef::Catalog(arg()?),
            "Listing" => TypeRef::Listing(arg()?),
            "Phantom" => TypeRef::Phantom(arg()?),
            "SideTable" => {
                let key = arg()?;
                TypeRef::SideTable(key, arg()?)
            }
            _ => TypeRef::Named(name),
        };
        Ok(ty)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Bool => f.write_str("Bool"),
            TypeRef::Int => f.write_str("Int"),
            TypeRef::Float => f.write_str("Float"),
            TypeRef::Text => f.write_str("Text"),
            TypeRef::Identifier => f.write_str("Identifier"),
            TypeRef::Reference(t) => write!(f, "Reference<{t}>"),
            TypeRef::Catalog(t) => write!(f, "Catalog<{t}>"),
            TypeRef::Listing(t) => write!(f, "Listing<{t}>"),
            TypeRef::SideTable(k, v) => write!(f, "SideTable<{k}, {v}>"),
            TypeRef::Phantom(t) => write!(f, "Phantom<{t}>"),
            TypeRef::Named(n) => f.write_str(n),
        }
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({self})")
    }
}

impl FromStr for TypeRef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TypeRef {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TypeRef> for String {
    fn from(value: TypeRef) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// TypeDef
// ---------------------------------------------------------------------------

/// Declared type of one record field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FieldRepr")]
pub struct FieldShape {
    #[serde(rename = "type")]
    pub ty: TypeRef,
    /// Optional fields may be absent and may be deleted.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldRepr {
    Short(TypeRef),
    Full {
        #[serde(rename = "type")]
        ty: TypeRef,
        #[serde(default)]
        optional: bool,
    },
}

impl From<FieldRepr> for FieldShape {
    fn from(repr: FieldRepr) -> Self {
        match repr {
            FieldRepr::Short(ty) => FieldShape {
                ty,
                optional: false,
            },
            FieldRepr::Full { ty, optional } => FieldShape { ty, optional },
        }
    }
}

/// Ordered field declarations of a record type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShape {
    pub fields: IndexMap<String, FieldShape>,
}

impl RecordShape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a mandatory field.
    pub fn field(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.fields.insert(
            name.into(),
            FieldShape {
                ty,
                optional: false,
            },
        );
        self
    }

    /// Declare an optional field.
    pub fn optional(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.fields.insert(name.into(), FieldShape { ty, optional: true });
        self
    }

    /// Returns `true` if records of this shape are entities.
    pub fn is_entity(&self) -> bool {
        matches!(
            self.fields.get(ID_FIELD),
            Some(FieldShape {
                ty: TypeRef::Identifier,
                optional: false
            })
        )
    }
}

/// The closed set of cases of a tagged union.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantFamily {
    pub cases: IndexMap<String, TypeRef>,
}

impl VariantFamily {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case(mut self, tag: impl Into<String>, ty: TypeRef) -> Self {
        self.cases.insert(tag.into(), ty);
        self
    }
}

/// A registered named type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeDef {
    Record(RecordShape),
    Variant(VariantFamily),
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// The type-descriptor registry of one tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub root: TypeRef,
    #[serde(default)]
    pub types: IndexMap<String, TypeDef>,
}

impl Schema {
    pub fn new(root: TypeRef) -> Self {
        Self {
            root,
            types: IndexMap::new(),
        }
    }

    /// Register a record type.
    pub fn record(mut self, name: impl Into<String>, shape: RecordShape) -> Self {
        self.types.insert(name.into(), TypeDef::Record(shape));
        self
    }

    /// Register a variant family.
    pub fn variant(mut self, name: impl Into<String>, family: VariantFamily) -> Self {
        self.types.insert(name.into(), TypeDef::Variant(family));
        self
    }

    /// Parse a schema from its TOML form.
    pub fn from_toml_str(text: &str) -> Result<Self, TypeError> {
        let schema: Schema =
            toml::from_str(text).map_err(|e| TypeError::Serialization(e.to_string()))?;
        schema.validate_definitions()?;
        Ok(schema)
    }

    pub fn record_shape(&self, name: &str) -> Option<&RecordShape> {
        match self.types.get(name) {
            Some(TypeDef::Record(shape)) => Some(shape),
            _ => None,
        }
    }

    pub fn variant_family(&self, name: &str) -> Option<&VariantFamily> {
        match self.types.get(name) {
            Some(TypeDef::Variant(family)) => Some(family),
            _ => None,
        }
    }

    /// Check that every named type exists and containers hold entities.
    pub fn validate_definitions(&self) -> Result<(), TypeError> {
        self.check_type_ref(&self.root)?;
        for def in self.types.values() {
            match def {
                TypeDef::Record(shape) => {
                    for field in shape.fields.values() {
                        self.check_type_ref(&field.ty)?;
                    }
                }
                TypeDef::Variant(family) => {
                    if family.cases.is_empty() {
                        return Err(TypeError::SchemaViolation {
                            path: "schema".into(),
                            reason: "variant families must declare at least one case".into(),
                        });
                    }
                    for ty in family.cases.values() {
                        self.check_type_ref(ty)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_type_ref(&self, ty: &TypeRef) -> Result<(), TypeError> {
        match ty {
            TypeRef::Named(name) => {
                if self.types.contains_key(name) {
                    Ok(())
                } else {
                    Err(TypeError::UnknownType(name.clone()))
                }
            }
            TypeRef::Catalog(inner) | TypeRef::Listing(inner) => self.check_entity(inner),
            TypeRef::SideTable(key, value) => {
                self.check_entity(key)?;
                self.check_type_ref(value)
            }
            TypeRef::Reference(inner) | TypeRef::Phantom(inner) => self.check_type_ref(inner),
            _ => Ok(()),
        }
    }

    fn check_entity(&self, ty: &TypeRef) -> Result<(), TypeError> {
        self.check_type_ref(ty)?;
        match ty {
            TypeRef::Named(name) if self.record_shape(name).is_some_and(RecordShape::is_entity) => {
                Ok(())
            }
            other => Err(TypeError::SchemaViolation {
                path: "schema".into(),
                reason: format!("{other} is not an entity type (needs an `id: Identifier` field)"),
            }),
        }
    }

    /// The static type reached by walking `path` from the root.
    ///
    /// Parameter segments are accepted wherever an identifier is expected.
    pub fn type_at(&self, path: &Path) -> Result<TypeRef, TypeError> {
        let mut current = self.root.clone();
        for (depth, segment) in path.segments().iter().enumerate() {
            let no_position = || TypeError::NoSuchPosition {
                path: path.truncated(depth + 1).to_string(),
            };
            current = match &current {
                TypeRef::Catalog(inner) | TypeRef::Listing(inner) => (**inner).clone(),
                TypeRef::SideTable(_, value) => (**value).clone(),
                TypeRef::Named(name) => {
                    let name_segment = segment.as_literal().ok_or_else(no_position)?;
                    match self.types.get(name) {
                        Some(TypeDef::Record(shape)) => shape
                            .fields
                            .get(name_segment)
                            .map(|f| f.ty.clone())
                            .ok_or_else(no_position)?,
                        Some(TypeDef::Variant(family)) => family
                            .cases
                            .get(name_segment)
                            .cloned()
                            .ok_or_else(no_position)?,
                        None => return Err(TypeError::UnknownType(name.clone())),
                    }
                }
                _ => return Err(no_position()),
            };
        }
        Ok(current)
    }

    /// Returns `true` if `path` names a field that records may omit.
    pub fn is_optional_field(&self, path: &Path) -> bool {
        let (Some(parent), Some(Segment::Literal(field))) = (path.parent(), path.last()) else {
            return false;
        };
        match self.type_at(&parent) {
            Ok(TypeRef::Named(name)) => self
                .record_shape(&name)
                .and_then(|shape| shape.fields.get(&**field))
                .is_some_and(|f| f.optional || f.ty.is_phantom()),
            _ => false,
        }
    }

    /// Shallow check that `node` has the runtime kind `ty` demands.
    pub fn check(&self, ty: &TypeRef, node: &Node) -> Result<(), TypeError> {
        self.check_at(ty, node, "/")
    }

    fn check_at(&self, ty: &TypeRef, node: &Node, at: &str) -> Result<(), TypeError> {
        let ok = match (ty, node) {
            (TypeRef::Bool, Node::Bool(_))
            | (TypeRef::Int, Node::Int(_))
            | (TypeRef::Float, Node::Float(_))
            | (TypeRef::Text, Node::Text(_))
            | (TypeRef::Identifier, Node::Id(_))
            | (TypeRef::Reference(_), Node::Ref(_))
            | (TypeRef::Catalog(_), Node::Catalog(_))
            | (TypeRef::Listing(_), Node::Listing(_))
            | (TypeRef::SideTable(_, _), Node::SideTable(_)) => true,
            (TypeRef::Named(name), Node::Record(r)) => {
                self.record_shape(name).is_some() && r.type_name() == name
            }
            (TypeRef::Named(name), Node::Variant(v)) => {
                self.variant_family(name).is_some() && v.family() == name
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(TypeError::SchemaViolation {
                path: at.to_string(),
                reason: format!("expected {ty}, found {}", describe(node)),
            })
        }
    }

    /// Deep check of `node` against `ty`.
    pub fn validate(&self, ty: &TypeRef, node: &Node) -> Result<(), TypeError> {
        self.validate_at(ty, node, &Path::root())
    }

    fn validate_at(&self, ty: &TypeRef, node: &Node, at: &Path) -> Result<(), TypeError> {
        self.check_at(ty, node, &at.to_string())?;
        match (ty, node) {
            (TypeRef::Named(name), Node::Record(record)) => {
                let Some(shape) = self.record_shape(name) else {
                    return Err(TypeError::UnknownType(name.clone()));
                };
                if let Some((field, _)) = record
                    .fields()
                    .find(|(field, _)| !shape.fields.contains_key(*field))
                {
                    return Err(TypeError::SchemaViolation {
                        path: at.to_string(),
                        reason: format!("{name} has no field {field:?}"),
                    });
                }
                for (field, decl) in &shape.fields {
                    let field_path = at.child(Segment::literal(field)?);
                    match record.field(field) {
                        Some(_) if decl.ty.is_phantom() => {
                            return Err(TypeError::SchemaViolation {
                                path: field_path.to_string(),
                                reason: "phantom fields never hold a value".into(),
                            });
                        }
                        Some(value) => self.validate_at(&decl.ty, value, &field_path)?,
                        None if decl.optional || decl.ty.is_phantom() => {}
                        None => {
                            return Err(TypeError::SchemaViolation {
                                path: field_path.to_string(),
                                reason: "mandatory field is missing".into(),
                            });
                        }
                    }
                }
                Ok(())
            }
            (TypeRef::Named(name), Node::Variant(variant)) => {
                let Some(family) = self.variant_family(name) else {
                    return Err(TypeError::UnknownType(name.clone()));
                };
                let case_ty = family.cases.get(variant.tag()).ok_or_else(|| {
                    TypeError::SchemaViolation {
                        path: at.to_string(),
                        reason: format!("{name} has no case {:?}", variant.tag()),
                    }
                })?;
                let case_path = at.child(Segment::literal(variant.tag())?);
                self.validate_at(case_ty, variant.value(), &case_path)
            }
            (TypeRef::Catalog(element), Node::Catalog(catalog)) => {
                for (id, entity) in catalog.iter() {
                    self.validate_at(element, entity, &at.child(id))?;
                }
                Ok(())
            }
            (TypeRef::SideTable(_, value_ty), Node::SideTable(table)) => {
                for (id, value) in table.iter() {
                    self.validate_at(value_ty, value, &at.child(id))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stable BLAKE3 fingerprint of this schema, stored as the durable manifest.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"arbor-schema-v1:");
        // Serializing an in-memory schema to JSON cannot fail: every key is a string.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(&canonical);
        hex::encode(hasher.finalize().as_bytes())
    }
}

fn describe(node: &Node) -> String {
    match node {
        Node::Record(r) => format!("record {}", r.type_name()),
        Node::Variant(v) => format!("variant {}::{}", v.family(), v.tag()),
        other => other.kind().to_string(),
    }
}
