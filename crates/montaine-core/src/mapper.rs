//! Mapping stage: project a source document through a mapping schema.
//!
//! The mapped document has exactly the shape of the schema. Path leaves copy
//! the value they address in the source; array templates are replicated once
//! per element of the source array they address.
//!
//! # Array templates
//!
//! A template is written against index `0` of its source array:
//!
//! ```text
//! {"items": [{"price": "data.items.0.price"}]}
//! ```
//!
//! The source array is found from the template's first leaf path that
//! addresses an array at the template's nesting depth (`data.items`). For
//! every element `i`, the template is re-addressed from `data.items.0` to
//! `data.items.i` with [`rewrite_path`] and mapped again. Nested templates
//! repeat the process one numeric segment further down.

use serde_json::{Map, Value};

use crate::error::{kind_of, MappingError};
use crate::path::{get_path, join, rewrite_path};
use crate::schema::SchemaNode;

/// Map a source document (or an array of source documents) through `schema`.
///
/// An object schema needs an object source. An array schema is applied
/// element-wise to an array source, with template paths relative to each
/// element.
pub fn map_document(source: &Value, schema: &SchemaNode) -> Result<Value, MappingError> {
    match (schema, source) {
        (SchemaNode::Object(_), Value::Object(_)) => map_node(source, schema, "", 0),
        (SchemaNode::ArrayTemplate(template), Value::Array(items)) => items
            .iter()
            .map(|item| map_node(item, template, "0", 0))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Err(MappingError::ShapeMismatch {
            at: String::new(),
            expected: schema.kind(),
            found: kind_of(source),
        }),
    }
}

fn map_node(
    source: &Value,
    node: &SchemaNode,
    at: &str,
    depth: usize,
) -> Result<Value, MappingError> {
    match node {
        SchemaNode::Path(path) => get_path(source, path)
            .cloned()
            .ok_or_else(|| MappingError::MissingPath { path: path.clone() }),
        SchemaNode::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, child) in fields {
                out.insert(key.clone(), map_node(source, child, &join(at, key), depth)?);
            }
            Ok(Value::Object(out))
        }
        SchemaNode::ArrayTemplate(template) => replicate(source, template, at, depth),
        SchemaNode::Call(_) => Err(MappingError::ShapeMismatch {
            at: at.to_string(),
            expected: "a path",
            found: "a typing call",
        }),
    }
}

fn replicate(
    source: &Value,
    template: &SchemaNode,
    at: &str,
    depth: usize,
) -> Result<Value, MappingError> {
    let element_at = join(at, "0");
    let array_path = match addressed_array(template, depth) {
        Some(path) => path,
        None => return Ok(Value::Array(vec![map_node(source, template, &element_at, depth + 1)?])),
    };

    let len = match get_path(source, &array_path) {
        Some(Value::Array(items)) => items.len(),
        Some(other) => {
            return Err(MappingError::ShapeMismatch {
                at: array_path,
                expected: "an array",
                found: kind_of(other),
            })
        }
        None => return Err(MappingError::MissingPath { path: array_path }),
    };

    let first = join(&array_path, "0");
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let element_at = join(at, &i.to_string());
        let mapped = if i == 0 {
            map_node(source, template, &element_at, depth + 1)?
        } else {
            let rewritten = rewrite_path(template, &first, &join(&array_path, &i.to_string()));
            map_node(source, &rewritten, &element_at, depth + 1)?
        };
        out.push(mapped);
    }
    Ok(Value::Array(out))
}

/// Path of the source array a template at `depth` iterates over.
///
/// Leaf paths of a template at depth `d` already carry the indices of the
/// `d` enclosing arrays; the next numeric segment, when it is `0`, marks the
/// array this template replicates.
fn addressed_array(template: &SchemaNode, depth: usize) -> Option<String> {
    template.leaf_paths().into_iter().find_map(|path| {
        let segments: Vec<&str> = path.split('.').collect();
        let position = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.parse::<usize>().is_ok())
            .map(|(i, _)| i)
            .nth(depth)?;
        (segments[position] == "0" && position > 0).then(|| segments[..position].join("."))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(json: &str) -> SchemaNode {
        SchemaNode::parse_mapping(json).unwrap()
    }

    #[test]
    fn test_price_scenario() {
        let source = json!({ "meta": { "id": "x1" }, "data": { "price": "12,50 €" } });
        let mapped =
            map_document(&source, &mapping(r#"{"@id":"meta.id","price":"data.price"}"#)).unwrap();
        assert_eq!(mapped, json!({ "@id": "x1", "price": "12,50 €" }));
    }

    #[test]
    fn test_template_replicates_per_source_element() {
        let source = json!({
            "shop": "s1",
            "data": { "items": [
                { "name": "a", "price": 1 },
                { "name": "b", "price": 2 },
                { "name": "c", "price": 3 }
            ]}
        });
        let schema = mapping(
            r#"{"items":[{"name":"data.items.0.name","price":"data.items.0.price","shop":"shop"}]}"#,
        );
        let mapped = map_document(&source, &schema).unwrap();
        assert_eq!(
            mapped,
            json!({ "items": [
                { "name": "a", "price": 1, "shop": "s1" },
                { "name": "b", "price": 2, "shop": "s1" },
                { "name": "c", "price": 3, "shop": "s1" }
            ]})
        );
    }

    #[test]
    fn test_index_ten_is_not_confused_with_index_one() {
        let items: Vec<Value> = (0..12).map(|i| json!({ "v": i })).collect();
        let source = json!({ "items": items });
        let mapped = map_document(&source, &mapping(r#"{"vs":[{"v":"items.0.v"}]}"#)).unwrap();
        let values: Vec<i64> = mapped["vs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["v"].as_i64().unwrap())
            .collect();
        assert_eq!(values, (0..12).collect::<Vec<i64>>());
    }

    #[test]
    fn test_nested_templates() {
        let source = json!({ "orders": [
            { "id": 1, "lines": [{ "sku": "a" }, { "sku": "b" }] },
            { "id": 2, "lines": [{ "sku": "c" }] }
        ]});
        let schema = mapping(
            r#"{"orders":[{"id":"orders.0.id","lines":[{"sku":"orders.0.lines.0.sku"}]}]}"#,
        );
        let mapped = map_document(&source, &schema).unwrap();
        assert_eq!(
            mapped,
            json!({ "orders": [
                { "id": 1, "lines": [{ "sku": "a" }, { "sku": "b" }] },
                { "id": 2, "lines": [{ "sku": "c" }] }
            ]})
        );
    }

    #[test]
    fn test_empty_source_array_maps_to_empty_array() {
        let source = json!({ "data": { "items": [] } });
        let mapped =
            map_document(&source, &mapping(r#"{"items":[{"p":"data.items.0.p"}]}"#)).unwrap();
        assert_eq!(mapped, json!({ "items": [] }));
    }

    #[test]
    fn test_template_without_array_path_yields_one_element() {
        let source = json!({ "meta": { "id": 7 } });
        let mapped = map_document(&source, &mapping(r#"{"ids":[{"id":"meta.id"}]}"#)).unwrap();
        assert_eq!(mapped, json!({ "ids": [{ "id": 7 }] }));
    }

    #[test]
    fn test_missing_path_aborts_mapping() {
        let source = json!({ "meta": {} });
        let err = map_document(&source, &mapping(r#"{"@id":"meta.id"}"#)).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingPath {
                path: "meta.id".into()
            }
        );
    }

    #[test]
    fn test_null_and_empty_values_are_copied() {
        let source = json!({ "a": null, "b": "" });
        let mapped = map_document(&source, &mapping(r#"{"x":"a","y":"b"}"#)).unwrap();
        assert_eq!(mapped, json!({ "x": null, "y": "" }));
    }

    #[test]
    fn test_root_shape_mismatch() {
        let err = map_document(&json!([1, 2]), &mapping(r#"{"a":"b"}"#)).unwrap_err();
        assert!(matches!(err, MappingError::ShapeMismatch { .. }));

        let err = map_document(&json!({ "a": 1 }), &mapping(r#"[{"a":"a"}]"#)).unwrap_err();
        assert!(matches!(err, MappingError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_template_addressing_a_non_array() {
        let source = json!({ "data": { "items": { "0": { "p": 1 } } } });
        let err =
            map_document(&source, &mapping(r#"{"items":[{"p":"data.items.0.p"}]}"#)).unwrap_err();
        assert_eq!(
            err,
            MappingError::ShapeMismatch {
                at: "data.items".into(),
                expected: "an array",
                found: "object"
            }
        );
    }

    #[test]
    fn test_array_root_maps_element_wise() {
        let source = json!([{ "id": "a", "n": 1 }, { "id": "b", "n": 2 }]);
        let mapped = map_document(&source, &mapping(r#"[{"@id":"id","count":"n"}]"#)).unwrap();
        assert_eq!(
            mapped,
            json!([{ "@id": "a", "count": 1 }, { "@id": "b", "count": 2 }])
        );
    }

    #[test]
    fn test_mapped_shape_follows_schema() {
        let source = json!({ "a": { "b": [10, 20] }, "c": "x" });
        let schema = mapping(r#"{"first":"a.b.0","nested":{"c":"c","all":"a.b"}}"#);
        let mapped = map_document(&source, &schema).unwrap();
        assert_eq!(
            mapped,
            json!({ "first": 10, "nested": { "c": "x", "all": [10, 20] } })
        );
    }
}
