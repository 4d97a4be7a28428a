//! Schema trees.
//!
//! Mapping and typing schemas are stored as JSON strings on the integration
//! record. They are parsed once, at the pipeline boundary, into a
//! [`SchemaNode`] tree; no stage re-parses them.
//!
//! ```text
//! {"@id": "meta.id", "items": [{"price": "data.items.0.price"}]}
//!
//! Object
//! ├── "@id"   → Path("meta.id")
//! └── "items" → ArrayTemplate
//!               └── Object
//!                   └── "price" → Path("data.items.0.price")
//! ```

use serde_json::Value;

use crate::coerce::Coercion;
use crate::error::{SchemaError, TypingError};
use crate::path::join;

/// One node of a parsed schema tree.
///
/// Mapping schemas only hold [`Path`](SchemaNode::Path) leaves, typing
/// schemas only [`Call`](SchemaNode::Call) leaves. Object fields keep the
/// order in which they were written.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Path(String),
    Call(Coercion),
    Object(Vec<(String, SchemaNode)>),
    ArrayTemplate(Box<SchemaNode>),
}

impl SchemaNode {
    /// Parse a JSON-encoded mapping schema.
    pub fn parse_mapping(json: &str) -> Result<SchemaNode, SchemaError> {
        let value = parse_json(json)?;
        let node = build(&value, "", &mut |at, path| {
            if path.trim().is_empty() {
                Err(SchemaError::EmptyPath { at: at.to_string() })
            } else {
                Ok(SchemaNode::Path(path.trim().to_string()))
            }
        })?;
        ensure_container_root(node)
    }

    /// Parse a JSON-encoded typing schema, parsing every call expression.
    pub fn parse_typing(json: &str) -> Result<SchemaNode, TypingError> {
        let value = parse_json(json)?;
        let node = build(&value, "", &mut |at, rule| {
            Coercion::parse(rule)
                .map(SchemaNode::Call)
                .map_err(|e| e.at(at, rule))
        })?;
        Ok(ensure_container_root(node)?)
    }

    /// Child node for an object key, if this node is an object holding it.
    pub fn child(&self, key: &str) -> Option<&SchemaNode> {
        match self {
            SchemaNode::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Element template, if this node is an array template.
    pub fn template(&self) -> Option<&SchemaNode> {
        match self {
            SchemaNode::ArrayTemplate(inner) => Some(inner),
            _ => None,
        }
    }

    /// Leaf paths of a mapping subtree, in schema order.
    pub fn leaf_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            SchemaNode::Path(p) => out.push(p),
            SchemaNode::Call(_) => {}
            SchemaNode::Object(fields) => fields.iter().for_each(|(_, v)| v.collect_paths(out)),
            SchemaNode::ArrayTemplate(inner) => inner.collect_paths(out),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SchemaNode::Path(_) | SchemaNode::Call(_) => "a leaf",
            SchemaNode::Object(_) => "an object",
            SchemaNode::ArrayTemplate(_) => "an array",
        }
    }
}

fn parse_json(json: &str) -> Result<Value, SchemaError> {
    serde_json::from_str(json).map_err(|e| SchemaError::InvalidJson(e.to_string()))
}

fn ensure_container_root(node: SchemaNode) -> Result<SchemaNode, SchemaError> {
    match node {
        SchemaNode::Object(_) | SchemaNode::ArrayTemplate(_) => Ok(node),
        _ => Err(SchemaError::InvalidRoot),
    }
}

fn build<E, F>(value: &Value, at: &str, leaf: &mut F) -> Result<SchemaNode, E>
where
    E: From<SchemaError>,
    F: FnMut(&str, &str) -> Result<SchemaNode, E>,
{
    match value {
        Value::String(s) => leaf(at, s),
        Value::Object(map) => {
            let mut fields = Vec::with_capacity(map.len());
            for (key, child) in map {
                fields.push((key.clone(), build(child, &join(at, key), leaf)?));
            }
            Ok(SchemaNode::Object(fields))
        }
        Value::Array(items) if items.len() == 1 => {
            let inner = build(&items[0], &join(at, "0"), leaf)?;
            Ok(SchemaNode::ArrayTemplate(Box::new(inner)))
        }
        Value::Array(items) => Err(SchemaError::TemplateArity {
            at: at.to_string(),
            len: items.len(),
        }
        .into()),
        _ => Err(SchemaError::InvalidLeaf { at: at.to_string() }.into()),
    }
}
