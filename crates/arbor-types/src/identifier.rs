use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// Characters that may never appear in an identifier.
const FORBIDDEN_CHARS: &[char] = &['/', ' ', '\t', '\n', '\r'];

/// Opaque name of an entity within its parent container.
///
/// Identifiers are immutable, compared by value, and ordered
/// lexicographically. Cloning is cheap: the text is shared behind an `Arc`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Arc<str>);

impl Identifier {
    /// Validate and wrap a string as an identifier.
    pub fn new(value: impl AsRef<str>) -> Result<Self, TypeError> {
        let value = value.as_ref();
        validate_identifier(value)?;
        Ok(Self(Arc::from(value)))
    }

    /// Mint a fresh, time-ordered identifier (UUID v7).
    pub fn unique() -> Self {
        Self(Arc::from(uuid::Uuid::now_v7().to_string()))
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validate identifier text, returning `Ok(())` if valid.
///
/// # Examples
///
/// ```
/// use arbor_types::identifier::validate_identifier;
///
/// assert!(validate_identifier("earth").is_ok());
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier("a/b").is_err());
/// ```
pub fn validate_identifier(value: &str) -> Result<(), TypeError> {
    if value.is_empty() {
        return Err(TypeError::InvalidIdentifier {
            value: value.to_string(),
            reason: "identifier must not be empty".into(),
        });
    }

    for ch in FORBIDDEN_CHARS {
        if value.contains(*ch) {
            return Err(TypeError::InvalidIdentifier {
                value: value.to_string(),
                reason: format!("contains forbidden character: {ch:?}"),
            });
        }
    }

    if value.chars().any(char::is_control) {
        return Err(TypeError::InvalidIdentifier {
            value: value.to_string(),
            reason: "contains a control character".into(),
        });
    }

    Ok(())
}

impl FromStr for Identifier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Identifier::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identifiers() {
        assert!(Identifier::new("earth").is_ok());
        assert!(Identifier::new("planet-42").is_ok());
        assert!(Identifier::new("a.b_c").is_ok());
    }

    #[test]
    fn rejects_empty_and_slashes() {
        assert!(Identifier::new("").is_err());
        assert!(Identifier::new("a/b").is_err());
        assert!(Identifier::new("has space").is_err());
        assert!(Identifier::new("bell\u{7}").is_err());
    }

    #[test]
    fn unique_identifiers_differ() {
        let a = Identifier::unique();
        let b = Identifier::unique();
        assert_ne!(a, b);
    }

    #[test]
    fn equality_is_by_value() {
        let a = Identifier::new("mars").unwrap();
        let b: Identifier = "mars".parse().unwrap();
        assert_eq!(a, b);
        assert!(Identifier::new("a").unwrap() < Identifier::new("b").unwrap());
    }

    #[test]
    fn serde_rejects_invalid_text() {
        let parsed: Result<Identifier, _> = serde_json::from_str("\"x/y\"");
        assert!(parsed.is_err());
        let ok: Identifier = serde_json::from_str("\"venus\"").unwrap();
        assert_eq!(ok.as_str(), "venus");
    }
}
