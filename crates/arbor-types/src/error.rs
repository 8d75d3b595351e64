use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid type expression {expr:?}: {reason}")]
    InvalidTypeExpr { expr: String, reason: String },

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("schema has no position at {path}")]
    NoSuchPosition { path: String },

    #[error("schema violation at {path}: {reason}")]
    SchemaViolation { path: String, reason: String },

    #[error("catalog entry {key} carries id {found}")]
    IdMismatch { key: String, found: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}
