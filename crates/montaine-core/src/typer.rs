//! Typing stage: apply a parsed typing schema to a mapped document.
//!
//! The walk follows the **document**, not the schema. Every element of an
//! array is typed with the schema's single template, so all elements of a
//! replicated array share one rule. Null and empty-string leaves are removed
//! instead of coerced; leaves without a rule pass through unchanged.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{kind_of, TypingError};
use crate::path::join;
use crate::schema::SchemaNode;

/// Clock shared by every coercion in one typing pass.
///
/// Pipeline runs pass their observation instant so `HOUR()` and
/// `DATE_NEXT_DAY()` agree with the history timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TypingContext {
    pub now: DateTime<Utc>,
}

impl TypingContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Default for TypingContext {
    fn default() -> Self {
        Self { now: Utc::now() }
    }
}

/// Type a mapped document (or an array of mapped documents).
///
/// The schema root and the document root must both be objects or both be
/// arrays. Returns a new value; `mapped` is left untouched.
pub fn type_document(
    mapped: &Value,
    schema: &SchemaNode,
    ctx: &TypingContext,
) -> Result<Value, TypingError> {
    match (schema, mapped) {
        (SchemaNode::Object(_), Value::Object(_)) | (SchemaNode::ArrayTemplate(_), Value::Array(_)) => {
            Ok(type_node(mapped, Some(schema), "", None, ctx)?.unwrap_or(Value::Null))
        }
        _ => Err(TypingError::ShapeMismatch {
            at: String::new(),
            expected: schema.kind(),
            found: kind_of(mapped),
        }),
    }
}

/// `None` means the node is empty and must be dropped from its parent.
fn type_node(
    value: &Value,
    rule: Option<&SchemaNode>,
    at: &str,
    siblings: Option<&Map<String, Value>>,
    ctx: &TypingContext,
) -> Result<Option<Value>, TypingError> {
    match value {
        Value::Object(map) => {
            if let Some(node @ (SchemaNode::Call(_) | SchemaNode::ArrayTemplate(_))) = rule {
                return Err(mismatch(at, node, value));
            }
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_rule = rule.and_then(|r| r.child(key));
                if let Some(typed) = type_node(child, child_rule, &join(at, key), Some(map), ctx)? {
                    out.insert(key.clone(), typed);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        Value::Array(items) => {
            let template = match rule {
                None => None,
                Some(SchemaNode::ArrayTemplate(inner)) => Some(inner.as_ref()),
                Some(node) => return Err(mismatch(at, node, value)),
            };
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                if let Some(typed) = type_node(item, template, &join(at, &i.to_string()), None, ctx)? {
                    out.push(typed);
                }
            }
            Ok(Some(Value::Array(out)))
        }
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        scalar => match rule {
            None => Ok(Some(scalar.clone())),
            Some(SchemaNode::Call(call)) => call
                .apply(scalar, siblings, ctx)
                .map(Some)
                .map_err(|reason| TypingError::Coercion {
                    path: at.to_string(),
                    rule: call.raw.clone(),
                    reason,
                }),
            Some(node) => Err(mismatch(at, node, scalar)),
        },
    }
}

fn mismatch(at: &str, node: &SchemaNode, value: &Value) -> TypingError {
    TypingError::ShapeMismatch {
        at: at.to_string(),
        expected: node.kind(),
        found: kind_of(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> TypingContext {
        TypingContext::at(Utc.with_ymd_and_hms(2024, 5, 20, 9, 15, 0).unwrap())
    }

    fn typing(json: &str) -> SchemaNode {
        SchemaNode::parse_typing(json).unwrap()
    }

    #[test]
    fn test_price_scenario() {
        let mapped = json!({ "@id": "x1", "price": "12,50 €" });
        let typed = type_document(&mapped, &typing(r#"{"price":"NUMBER()"}"#), &ctx()).unwrap();
        assert_eq!(typed, json!({ "@id": "x1", "price": 12.5 }));
        // input is left as it was
        assert_eq!(mapped["price"], json!("12,50 €"));
    }

    #[test]
    fn test_array_elements_share_the_template_rule() {
        let mapped = json!({ "items": [{ "p": "1,5" }, { "p": "2" }, { "p": "-3,25" }] });
        let typed =
            type_document(&mapped, &typing(r#"{"items":[{"p":"NUMBER()"}]}"#), &ctx()).unwrap();
        assert_eq!(typed, json!({ "items": [{ "p": 1.5 }, { "p": 2 }, { "p": -3.25 }] }));
    }

    #[test]
    fn test_empty_leaves_are_removed_not_coerced() {
        let mapped = json!({ "a": null, "b": "", "c": "7", "tags": ["x", "", null, "y"] });
        let typed = type_document(
            &mapped,
            &typing(r#"{"a":"NUMBER()","b":"DATE()","c":"NUMBER()"}"#),
            &ctx(),
        )
        .unwrap();
        assert_eq!(typed, json!({ "c": 7, "tags": ["x", "y"] }));
    }

    #[test]
    fn test_leaves_without_rule_pass_through() {
        let mapped = json!({ "name": "Shop", "nested": { "n": 3 } });
        let typed = type_document(&mapped, &typing(r#"{"other":"STRING()"}"#), &ctx()).unwrap();
        assert_eq!(typed, mapped);
    }

    #[test]
    fn test_typing_is_idempotent_on_typed_scalars() {
        let schema = typing(r#"{"n":"NUMBER()","s":"STRING()","d":"DATE()"}"#);
        let once = type_document(
            &json!({ "n": "4,20", "s": 12, "d": "2024-01-02 03:04" }),
            &schema,
            &ctx(),
        )
        .unwrap();
        let twice = type_document(&once, &schema, &ctx()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_hour_reads_reference_from_sibling() {
        let mapped = json!({ "slot": { "day": "2024-07-01", "opens": "8h15" } });
        let typed = type_document(
            &mapped,
            &typing(r#"{"slot":{"day":"DATE()","opens":"HOUR(,day)"}}"#),
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            typed,
            json!({ "slot": {
                "day": "2024-07-01T00:00:00.000Z",
                "opens": "2024-07-01T08:15:00.000Z"
            }})
        );
    }

    #[test]
    fn test_constant_hour_uses_context_clock() {
        let mapped = json!({ "closing": "anything" });
        let typed = type_document(
            &mapped,
            &typing(r#"{"closing":"HOUR(\"14h30\", null)"}"#),
            &ctx(),
        )
        .unwrap();
        assert_eq!(typed, json!({ "closing": "2024-05-20T14:30:00.000Z" }));
    }

    #[test]
    fn test_coercion_failure_names_document_path_and_rule() {
        let mapped = json!({ "items": [{ "p": "1" }, { "p": "abc" }] });
        let err = type_document(&mapped, &typing(r#"{"items":[{"p":"NUMBER()"}]}"#), &ctx())
            .unwrap_err();
        match err {
            TypingError::Coercion { path, rule, .. } => {
                assert_eq!(path, "items.1.p");
                assert_eq!(rule, "NUMBER()");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let err = type_document(&json!([{ "a": 1 }]), &typing(r#"{"a":"NUMBER()"}"#), &ctx())
            .unwrap_err();
        assert!(matches!(err, TypingError::ShapeMismatch { .. }));

        let err = type_document(
            &json!({ "a": { "b": 1 } }),
            &typing(r#"{"a":"NUMBER()"}"#),
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TypingError::ShapeMismatch {
                at: "a".into(),
                expected: "a leaf",
                found: "object"
            }
        );
    }

    #[test]
    fn test_array_root_is_typed_element_wise() {
        let typed = type_document(
            &json!([{ "p": "1" }, { "p": "2,5" }]),
            &typing(r#"[{"p":"NUMBER()"}]"#),
            &ctx(),
        )
        .unwrap();
        assert_eq!(typed, json!([{ "p": 1 }, { "p": 2.5 }]));
    }
}
