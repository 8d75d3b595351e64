//! Schema-driven wire encoding of tree values.

use arbor_types::{
    Catalog, Identifier, Listing, Node, Path, Record, Schema, Segment, SideTable, TypeRef, Variant,
};
use serde_json::{Map, Number, Value};

use crate::error::{CodecError, CodecResult};

/// Encodes and decodes tree values for the durable store.
///
/// Decoding what was encoded with the same schema and type yields a value
/// equal to the original.
pub trait Codec: Send + Sync {
    fn encode(&self, schema: &Schema, ty: &TypeRef, node: &Node) -> CodecResult<Vec<u8>>;

    fn decode(&self, schema: &Schema, ty: &TypeRef, bytes: &[u8]) -> CodecResult<Node>;
}

/// JSON encoding guided by the schema.
///
/// Records become objects, catalogs become arrays of entities, variants
/// become `{"tag": .., "value": ..}`, and listings and side tables carry
/// their domain path next to their keys. A bare identifier is accepted
/// where an entity type is expected, which is how listing members travel.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn to_value(&self, schema: &Schema, ty: &TypeRef, node: &Node) -> CodecResult<Value> {
        encode_at(schema, ty, node, &Path::root())
    }

    pub fn from_value(&self, schema: &Schema, ty: &TypeRef, value: &Value) -> CodecResult<Node> {
        decode_at(schema, ty, value, &Path::root())
    }
}

impl Codec for JsonCodec {
    fn encode(&self, schema: &Schema, ty: &TypeRef, node: &Node) -> CodecResult<Vec<u8>> {
        let value = self.to_value(schema, ty, node)?;
        serde_json::to_vec(&value).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn decode(&self, schema: &Schema, ty: &TypeRef, bytes: &[u8]) -> CodecResult<Node> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        self.from_value(schema, ty, &value)
    }
}

fn encode_err(at: &Path, reason: impl Into<String>) -> CodecError {
    CodecError::Encode {
        path: at.to_string(),
        reason: reason.into(),
    }
}

fn decode_err(at: &Path, reason: impl Into<String>) -> CodecError {
    CodecError::Decode {
        path: at.to_string(),
        reason: reason.into(),
    }
}

fn field_path(at: &Path, name: &str) -> CodecResult<Path> {
    Segment::literal(name)
        .map(|s| at.child(s))
        .map_err(|e| CodecError::Malformed(e.to_string()))
}

fn encode_at(schema: &Schema, ty: &TypeRef, node: &Node, at: &Path) -> CodecResult<Value> {
    let value: Value = match (ty, node) {
        (TypeRef::Bool, Node::Bool(b)) => Value::Bool(*b),
        (TypeRef::Int, Node::Int(i)) => Value::from(*i),
        (TypeRef::Float, Node::Float(f)) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| encode_err(at, format!("{f} is not a finite number")))?,
        (TypeRef::Text, Node::Text(s)) => Value::String(s.to_string()),
        (TypeRef::Identifier, Node::Id(id)) => Value::String(id.as_str().to_string()),
        (TypeRef::Reference(_), Node::Ref(path)) => Value::String(path.to_string()),
        (TypeRef::Phantom(_), _) => return Err(encode_err(at, "phantom positions hold no value")),
        (TypeRef::Catalog(element), Node::Catalog(catalog)) => Value::Array(
            catalog
                .iter()
                .map(|(id, entity)| encode_at(schema, element, entity, &at.child(id)))
                .collect::<CodecResult<_>>()?,
        ),
        (TypeRef::Listing(_), Node::Listing(listing)) => {
            let mut obj = Map::new();
            obj.insert("domain".into(), Value::String(listing.domain().to_string()));
            obj.insert(
                "ids".into(),
                Value::Array(
                    listing
                        .ids()
                        .map(|id| Value::String(id.as_str().to_string()))
                        .collect(),
                ),
            );
            Value::Object(obj)
        }
        (TypeRef::SideTable(_, value_ty), Node::SideTable(table)) => {
            let entries = table
                .iter()
                .map(|(id, value)| {
                    Ok(Value::Array(vec![
                        Value::String(id.as_str().to_string()),
                        encode_at(schema, value_ty, value, &at.child(id))?,
                    ]))
                })
                .collect::<CodecResult<Vec<_>>>()?;
            let mut obj = Map::new();
            obj.insert("domain".into(), Value::String(table.domain().to_string()));
            obj.insert("entries".into(), Value::Array(entries));
            Value::Object(obj)
        }
        (TypeRef::Named(name), Node::Record(record)) => {
            let shape = schema
                .record_shape(name)
                .ok_or_else(|| encode_err(at, format!("{name} is not a record type")))?;
            if let Some((field, _)) = record.fields().find(|(f, _)| !shape.fields.contains_key(*f)) {
                return Err(encode_err(at, format!("{name} has no field {field:?}")));
            }
            let mut obj = Map::new();
            for (field, decl) in &shape.fields {
                if let Some(value) = record.field(field) {
                    let value = encode_at(schema, &decl.ty, value, &field_path(at, field)?)?;
                    obj.insert(field.clone(), value);
                }
            }
            Value::Object(obj)
        }
        (TypeRef::Named(name), Node::Id(id))
            if schema.record_shape(name).is_some_and(|s| s.is_entity()) =>
        {
            Value::String(id.as_str().to_string())
        }
        (TypeRef::Named(name), Node::Variant(variant)) => {
            let case_ty = schema
                .variant_family(name)
                .and_then(|family| family.cases.get(variant.tag()))
                .ok_or_else(|| encode_err(at, format!("{name} has no case {:?}", variant.tag())))?;
            let mut obj = Map::new();
            obj.insert("tag".into(), Value::String(variant.tag().to_string()));
            obj.insert(
                "value".into(),
                encode_at(schema, case_ty, variant.value(), &field_path(at, variant.tag())?)?,
            );
            Value::Object(obj)
        }
        (ty, node) => {
            return Err(encode_err(at, format!("expected {ty}, found {}", node.kind())));
        }
    };
    Ok(value)
}

fn as_str<'v>(value: &'v Value, at: &Path, what: &str) -> CodecResult<&'v str> {
    value
        .as_str()
        .ok_or_else(|| decode_err(at, format!("expected {what} as a string")))
}

fn identifier(value: &Value, at: &Path) -> CodecResult<Identifier> {
    Identifier::new(as_str(value, at, "identifier")?).map_err(|e| decode_err(at, e.to_string()))
}

fn domain(obj: &Map<String, Value>, at: &Path) -> CodecResult<Path> {
    let raw = obj
        .get("domain")
        .ok_or_else(|| decode_err(at, "missing domain"))?;
    Path::parse(as_str(raw, at, "domain")?).map_err(|e| decode_err(at, e.to_string()))
}

fn decode_at(schema: &Schema, ty: &TypeRef, value: &Value, at: &Path) -> CodecResult<Node> {
    let node: Node = match ty {
        TypeRef::Bool => Node::Bool(
            value
                .as_bool()
                .ok_or_else(|| decode_err(at, "expected a boolean"))?,
        ),
        TypeRef::Int => Node::Int(
            value
                .as_i64()
                .ok_or_else(|| decode_err(at, "expected an integer"))?,
        ),
        TypeRef::Float => Node::Float(
            value
                .as_f64()
                .ok_or_else(|| decode_err(at, "expected a number"))?,
        ),
        TypeRef::Text => Node::text(as_str(value, at, "text")?),
        TypeRef::Identifier => Node::Id(identifier(value, at)?),
        TypeRef::Reference(_) => Node::Ref(
            Path::parse(as_str(value, at, "reference")?)
                .map_err(|e| decode_err(at, e.to_string()))?,
        ),
        TypeRef::Phantom(_) => return Err(decode_err(at, "phantom positions hold no value")),
        TypeRef::Catalog(element) => {
            let items = value
                .as_array()
                .ok_or_else(|| decode_err(at, "expected an array of entities"))?;
            let entities = items
                .iter()
                .map(|item| decode_at(schema, element, item, at))
                .collect::<CodecResult<Vec<_>>>()?;
            Catalog::from_entities(entities)
                .map_err(|e| decode_err(at, e.to_string()))?
                .into()
        }
        TypeRef::Listing(_) => {
            let obj = value
                .as_object()
                .ok_or_else(|| decode_err(at, "expected a listing object"))?;
            let ids = obj
                .get("ids")
                .and_then(Value::as_array)
                .ok_or_else(|| decode_err(at, "missing ids"))?
                .iter()
                .map(|id| identifier(id, at))
                .collect::<CodecResult<Vec<_>>>()?;
            Listing::with_ids(domain(obj, at)?, ids).into()
        }
        TypeRef::SideTable(_, value_ty) => {
            let obj = value
                .as_object()
                .ok_or_else(|| decode_err(at, "expected a side table object"))?;
            let entries = obj
                .get("entries")
                .and_then(Value::as_array)
                .ok_or_else(|| decode_err(at, "missing entries"))?;
            let mut table = SideTable::new(domain(obj, at)?);
            for entry in entries {
                let Some([key, item]) = entry.as_array().map(Vec::as_slice) else {
                    return Err(decode_err(at, "side table entries are [key, value] pairs"));
                };
                let key = identifier(key, at)?;
                let item = decode_at(schema, value_ty, item, &at.child(&key))?;
                table = table.with(key, item);
            }
            table.into()
        }
        TypeRef::Named(name) => {
            if let Some(shape) = schema.record_shape(name) {
                if shape.is_entity() && value.is_string() {
                    return Ok(Node::Id(identifier(value, at)?));
                }
                let obj = value
                    .as_object()
                    .ok_or_else(|| decode_err(at, format!("expected a {name} object")))?;
                if let Some(field) = obj.keys().find(|k| !shape.fields.contains_key(*k)) {
                    return Err(decode_err(at, format!("{name} has no field {field:?}")));
                }
                let mut record = Record::new(name);
                for (field, decl) in &shape.fields {
                    match obj.get(field) {
                        Some(raw) => {
                            let item = decode_at(schema, &decl.ty, raw, &field_path(at, field)?)?;
                            record = record.with_field(field, item);
                        }
                        None if decl.optional || decl.ty.is_phantom() => {}
                        None => {
                            return Err(decode_err(
                                &field_path(at, field)?,
                                "mandatory field is missing",
                            ));
                        }
                    }
                }
                record.into()
            } else if let Some(family) = schema.variant_family(name) {
                let obj = value
                    .as_object()
                    .ok_or_else(|| decode_err(at, format!("expected a {name} object")))?;
                let tag = as_str(
                    obj.get("tag").ok_or_else(|| decode_err(at, "missing tag"))?,
                    at,
                    "tag",
                )?;
                let case_ty = family
                    .cases
                    .get(tag)
                    .ok_or_else(|| decode_err(at, format!("{name} has no case {tag:?}")))?;
                let raw = obj
                    .get("value")
                    .ok_or_else(|| decode_err(at, "missing value"))?;
                let inner = decode_at(schema, case_ty, raw, &field_path(at, tag)?)?;
                Variant::new(name, tag, inner).into()
            } else {
                return Err(decode_err(at, format!("unknown type {name}")));
            }
        }
    };
    Ok(node)
}
