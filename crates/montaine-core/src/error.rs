//! Error types raised by the pure pipeline stages.
//!
//! Stages never catch their own errors; the orchestrator records them.

/// A schema tree that cannot be parsed into a [`SchemaNode`](crate::SchemaNode).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("schema root must be an object or a single-element array")]
    InvalidRoot,

    #[error("empty path at '{at}'")]
    EmptyPath { at: String },

    #[error("array template at '{at}' must hold exactly one element, found {len}")]
    TemplateArity { at: String, len: usize },

    #[error("schema leaf at '{at}' must be a string")]
    InvalidLeaf { at: String },
}

/// Raised while projecting a source document through a mapping schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MappingError {
    #[error("path '{path}' not found in source document")]
    MissingPath { path: String },

    #[error("shape mismatch at '{at}': schema expects {expected}, source has {found}")]
    ShapeMismatch {
        at: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Raised while parsing or applying a typing rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TypingError {
    #[error("unknown coercion at '{path}': {rule}")]
    UnknownCoercion { path: String, rule: String },

    #[error("malformed rule at '{path}': {rule} ({reason})")]
    MalformedCall {
        path: String,
        rule: String,
        reason: String,
    },

    #[error("cannot apply {rule} at '{path}': {reason}")]
    Coercion {
        path: String,
        rule: String,
        reason: String,
    },

    #[error("shape mismatch at '{at}': typing schema expects {expected}, document has {found}")]
    ShapeMismatch {
        at: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid typing schema: {0}")]
    Schema(#[from] SchemaError),
}

/// Raised by the historizer on records it cannot turn into a write-set.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HistorizeError {
    #[error("record root must be an object, found {found}")]
    NotAnObject { found: &'static str },

    #[error("identity marker below the record root at '{path}'")]
    NestedIdentity { path: String },

    #[error("leaf at '{path}' is not a history entry")]
    UnhistorizedLeaf { path: String },
}

/// Short JSON type name used in error messages.
pub(crate) fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_error_names_path_and_rule() {
        let err = TypingError::UnknownCoercion {
            path: "price".into(),
            rule: "FOO()".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("price"), "got: {msg}");
        assert!(msg.contains("FOO()"), "got: {msg}");
    }

    #[test]
    fn test_schema_error_converts_into_typing_error() {
        let err: TypingError = SchemaError::InvalidRoot.into();
        assert!(matches!(err, TypingError::Schema(SchemaError::InvalidRoot)));
    }
}
