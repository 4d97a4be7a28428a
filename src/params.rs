//! Request parameters for scheduled (`auto`) runs.
//!
//! An auto run does not use only the static `params` of its integration. It
//! reads the integration's aggregation pipeline, recovers parameter values
//! from its `$match` stages, and checks them against a [`ParamSchema`]
//! generated from the declared `parameters` before anything is fetched.
//!
//! ```text
//! [{"$match": {"store": "paris", "day": {"$eq": "2024-05-01"}}},
//!  {"$match": {"$and": [{"kind": {"$in": ["fresh", "frozen"]}}]}}]
//!   → {"store": "paris", "day": "2024-05-01", "kind": "fresh"}
//! ```

use serde_json::{json, Map, Value};

use crate::config::{ParamKind, ParameterSpec};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("integration has no auto_pipeline")]
    NoPipeline,

    #[error("auto_pipeline must be a JSON array of stages: {0}")]
    NotAPipeline(String),

    #[error("generated parameter schema is invalid: {0}")]
    BadSchema(String),

    #[error("parameters do not match the declared schema: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Recover parameters from the `$match` stages of an aggregation pipeline.
///
/// Scalar field values, `$eq` operands and the first `$in` operand are
/// taken; `$and` arrays are descended. Later stages override earlier ones.
/// Other operators (ranges, regexes) carry no single value and are skipped.
pub fn derive_params(pipeline: &Value) -> Result<Map<String, Value>, ValidationError> {
    let stages = pipeline
        .as_array()
        .ok_or_else(|| ValidationError::NotAPipeline(format!("found {}", kind_name(pipeline))))?;
    let mut params = Map::new();
    for stage in stages {
        if let Some(Value::Object(conditions)) = stage.get("$match") {
            collect_match(conditions, &mut params);
        }
    }
    Ok(params)
}

fn collect_match(conditions: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (field, condition) in conditions {
        if field == "$and" {
            for clause in condition.as_array().into_iter().flatten() {
                if let Value::Object(inner) = clause {
                    collect_match(inner, out);
                }
            }
            continue;
        }
        if field.starts_with('$') {
            continue;
        }
        let value = match condition {
            Value::Object(ops) => ops.get("$eq").cloned().or_else(|| {
                ops.get("$in")
                    .and_then(Value::as_array)
                    .and_then(|items| items.first())
                    .cloned()
            }),
            Value::Array(_) => None,
            scalar => Some(scalar.clone()),
        };
        if let Some(value) = value {
            out.insert(field.clone(), value);
        }
    }
}

/// JSON Schema generated from declared parameters.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    schema: Option<Value>,
}

/// Dates are ISO calendar days, optionally followed by a time.
const DATE_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}([T ].+)?$";

impl ParamSchema {
    /// Build an object schema with one property per declared parameter.
    /// Undeclared properties are rejected. No declarations means no schema.
    pub fn generate(specs: &[ParameterSpec]) -> Self {
        if specs.is_empty() {
            return Self { schema: None };
        }
        let mut properties = Map::new();
        for spec in specs {
            properties.insert(spec.name.clone(), property_schema(spec.kind));
        }
        let required: Vec<Value> = specs
            .iter()
            .filter(|s| s.required)
            .map(|s| Value::String(s.name.clone()))
            .collect();
        Self {
            schema: Some(json!({
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            })),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    /// Check derived parameters. An integration that declares no parameters
    /// accepts any.
    pub fn validate(&self, params: &Map<String, Value>) -> Result<(), ValidationError> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| ValidationError::BadSchema(e.to_string()))?;

        let instance = Value::Object(params.clone());
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();

        if !errors.is_empty() {
            return Err(ValidationError::Invalid(errors));
        }
        tracing::debug!(params = params.len(), "auto parameters passed schema validation");
        Ok(())
    }
}

fn property_schema(kind: ParamKind) -> Value {
    match kind {
        ParamKind::String => json!({ "type": "string" }),
        ParamKind::Number => json!({ "type": "number" }),
        ParamKind::Boolean => json!({ "type": "boolean" }),
        ParamKind::Date => json!({ "type": "string", "pattern": DATE_PATTERN }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, kind: ParamKind, required: bool) -> ParameterSpec {
        ParameterSpec {
            name: name.into(),
            kind,
            required,
        }
    }

    #[test]
    fn test_derive_from_match_stages() {
        let pipeline = json!([
            { "$match": { "store": "paris", "day": { "$eq": "2024-05-01" } } },
            { "$group": { "_id": "$sku" } },
            { "$match": { "$and": [
                { "kind": { "$in": ["fresh", "frozen"] } },
                { "price": { "$gte": 3 } }
            ]}},
            { "$match": { "store": "lyon" } }
        ]);
        let params = derive_params(&pipeline).unwrap();
        assert_eq!(
            Value::Object(params),
            json!({ "store": "lyon", "day": "2024-05-01", "kind": "fresh" })
        );
    }

    #[test]
    fn test_derive_rejects_non_array() {
        assert!(matches!(
            derive_params(&json!({ "$match": {} })),
            Err(ValidationError::NotAPipeline(_))
        ));
    }

    #[test]
    fn test_validate_accepts_declared_params() {
        let schema = ParamSchema::generate(&[
            spec("store", ParamKind::String, true),
            spec("day", ParamKind::Date, false),
            spec("limit", ParamKind::Number, false),
        ]);
        let params = derive_params(&json!([
            { "$match": { "store": "paris", "day": "2024-05-01", "limit": 10 } }
        ]))
        .unwrap();
        assert_eq!(schema.validate(&params), Ok(()));
    }

    fn errors_for(schema: &ParamSchema, params: &Map<String, Value>) -> Vec<String> {
        match schema.validate(params) {
            Err(ValidationError::Invalid(errors)) => errors,
            other => panic!("expected schema errors, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_errors() {
        let schema = ParamSchema::generate(&[
            spec("store", ParamKind::String, true),
            spec("day", ParamKind::Date, false),
        ]);
        let mut params = Map::new();
        let errors = errors_for(&schema, &params);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("store"), "got: {:?}", errors);

        params.insert("store".into(), json!(3));
        let errors = errors_for(&schema, &params);
        assert!(errors[0].starts_with("/store"), "got: {:?}", errors);

        params.insert("store".into(), json!("paris"));
        params.insert("day".into(), json!("not a date"));
        let errors = errors_for(&schema, &params);
        assert!(errors[0].starts_with("/day"), "got: {:?}", errors);

        params.remove("day");
        params.insert("region".into(), json!("north"));
        let errors = errors_for(&schema, &params);
        assert!(errors[0].contains("region"), "got: {:?}", errors);
    }

    #[test]
    fn test_validate_reports_every_error() {
        let schema = ParamSchema::generate(&[
            spec("store", ParamKind::String, true),
            spec("open", ParamKind::Boolean, true),
        ]);
        let mut params = Map::new();
        params.insert("store".into(), json!(false));
        params.insert("region".into(), json!("north"));
        assert_eq!(errors_for(&schema, &params).len(), 3);
    }

    #[test]
    fn test_generated_schema_shape() {
        let schema = ParamSchema::generate(&[
            spec("store", ParamKind::String, true),
            spec("day", ParamKind::Date, false),
            spec("limit", ParamKind::Number, false),
        ]);
        let json = schema.as_json().unwrap();
        assert_eq!(json["type"], json!("object"));
        assert_eq!(json["additionalProperties"], json!(false));
        assert_eq!(json["required"], json!(["store"]));
        assert_eq!(json["properties"]["limit"]["type"], json!("number"));
        assert_eq!(json["properties"]["day"]["type"], json!("string"));
        assert!(json["properties"]["day"]["pattern"].is_string());
    }

    #[test]
    fn test_no_declarations_accept_anything() {
        let mut params = Map::new();
        params.insert("x".into(), json!(1));
        let schema = ParamSchema::generate(&[]);
        assert!(schema.as_json().is_none());
        assert_eq!(schema.validate(&params), Ok(()));
    }
}
