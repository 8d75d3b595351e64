//! Slash-separated paths into the state tree.
//!
//! A path is written `/planets/-planet-/name`:
//! - the root is `/`
//! - each segment is either a literal (a field name or an [`Identifier`])
//!   or a parameter placeholder written `-name-`
//! - literal segments follow the identifier rules (non-empty, no `/`, no
//!   whitespace or control characters)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;
use crate::identifier::{validate_identifier, Identifier};

/// One step of a [`Path`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// A field name or entity identifier.
    Literal(Arc<str>),
    /// A placeholder bound later from a binding environment.
    Param(Arc<str>),
}

impl Segment {
    /// Build a literal segment, validating its text.
    pub fn literal(name: impl AsRef<str>) -> Result<Self, TypeError> {
        let name = name.as_ref();
        validate_identifier(name).map_err(|e| TypeError::InvalidPath {
            path: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::Literal(Arc::from(name)))
    }

    /// Build a parameter segment named `name` (written `-name-`).
    pub fn param(name: impl AsRef<str>) -> Result<Self, TypeError> {
        let name = name.as_ref();
        validate_param_name(name)?;
        Ok(Self::Param(Arc::from(name)))
    }

    /// The literal text, or `None` for a parameter.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Segment::Literal(s) => Some(s),
            Segment::Param(_) => None,
        }
    }

    /// The parameter name, or `None` for a literal.
    pub fn as_param(&self) -> Option<&str> {
        match self {
            Segment::Param(p) => Some(p),
            Segment::Literal(_) => None,
        }
    }

    /// Returns `true` if this is a parameter placeholder.
    pub fn is_param(&self) -> bool {
        matches!(self, Segment::Param(_))
    }

    /// Interpret a literal segment as an identifier.
    pub fn to_identifier(&self) -> Option<Identifier> {
        self.as_literal().and_then(|s| Identifier::new(s).ok())
    }

    fn parse(raw: &str, whole: &str) -> Result<Self, TypeError> {
        if raw.len() >= 2 && raw.starts_with('-') && raw.ends_with('-') {
            let name = &raw[1..raw.len() - 1];
            return Self::param(name).map_err(|e| TypeError::InvalidPath {
                path: whole.to_string(),
                reason: e.to_string(),
            });
        }
        validate_identifier(raw).map_err(|e| TypeError::InvalidPath {
            path: whole.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::Literal(Arc::from(raw)))
    }
}

impl From<Identifier> for Segment {
    fn from(id: Identifier) -> Self {
        Segment::Literal(Arc::from(id.as_str()))
    }
}

impl From<&Identifier> for Segment {
    fn from(id: &Identifier) -> Self {
        Segment::Literal(Arc::from(id.as_str()))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Param(p) => write!(f, "-{p}-"),
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

fn validate_param_name(name: &str) -> Result<(), TypeError> {
    if name.is_empty() {
        return Err(TypeError::InvalidPath {
            path: format!("-{name}-"),
            reason: "parameter name must not be empty".into(),
        });
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TypeError::InvalidPath {
            path: format!("-{name}-"),
            reason: "parameter names may only contain ASCII letters, digits and '_'".into(),
        });
    }
    Ok(())
}

/// An ordered sequence of segments from the root.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from already-validated segments.
    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    /// Parse the textual form, e.g. `/planets/-planet-/name`.
    ///
    /// # Examples
    ///
    /// ```
    /// use arbor_types::Path;
    ///
    /// let p = Path::parse("/planets/-planet-/name").unwrap();
    /// assert_eq!(p.len(), 3);
    /// assert!(!p.is_concrete());
    /// assert!(Path::parse("planets").is_err());
    /// assert!(Path::parse("/a//b").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        if !text.starts_with('/') {
            return Err(TypeError::InvalidPath {
                path: text.to_string(),
                reason: "path must start with '/'".into(),
            });
        }
        if text == "/" {
            return Ok(Self::root());
        }
        if text.ends_with('/') {
            return Err(TypeError::InvalidPath {
                path: text.to_string(),
                reason: "path must not end with '/'".into(),
            });
        }
        let segments = text[1..]
            .split('/')
            .map(|raw| {
                if raw.is_empty() {
                    Err(TypeError::InvalidPath {
                        path: text.to_string(),
                        reason: "path segments must not be empty".into(),
                    })
                } else {
                    Segment::parse(raw, text)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns `true` for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// A new path with `segment` appended.
    pub fn child(&self, segment: impl Into<Segment>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The path one level up, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(self.truncated(self.segments.len() - 1))
    }

    /// The last segment, or `None` at the root.
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The first `len` segments.
    pub fn truncated(&self, len: usize) -> Self {
        Self {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// Returns `true` if `self` is a (non-strict) prefix of `other`,
    /// comparing segments literally.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Returns `true` if no segment is a parameter.
    pub fn is_concrete(&self) -> bool {
        !self.segments.iter().any(Segment::is_param)
    }

    /// Names of the parameters in this path, in order of appearance.
    pub fn parameters(&self) -> Vec<&str> {
        self.segments.iter().filter_map(Segment::as_param).collect()
    }
}

impl FromStr for Path {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Path::parse(&raw).map_err(serde::de::Error::custom)
    }
}
