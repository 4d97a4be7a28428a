//! Historized records and write-set generation.
//!
//! [`prepare`] turns a typed record into its historized form: identity fields
//! (top-level keys starting with [`IDENTITY_MARKER`]) are copied verbatim and
//! every other scalar leaf becomes a one-entry history list:
//!
//! ```text
//! {"@id": "x1", "price": 12.5}
//!   → {"@id": "x1", "price": [{"observedAt": "2024-05-20T09:15:00.000Z", "value": 12.5}]}
//! ```
//!
//! [`build_write_set`] derives the backend operations that merge the record
//! into what is already stored: one base upsert for the identity, one guarded
//! `[]` initialisation per structural array, and one guarded front-push per
//! history leaf. An unchanged value never produces a new history entry since
//! the push is guarded by "latest stored value differs".

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::coerce::iso;
use crate::error::{kind_of, HistorizeError};
use crate::path::join;
use crate::write::{Filter, Guard, Update, WriteOp};

/// Leading character of identity keys.
pub const IDENTITY_MARKER: char = '@';

pub const OBSERVED_AT: &str = "observedAt";
pub const VALUE: &str = "value";

pub fn is_identity_key(key: &str) -> bool {
    key.starts_with(IDENTITY_MARKER)
}

/// Wrap every non-identity scalar of `typed` into a history entry observed
/// at `observed_at`.
pub fn prepare(typed: &Value, observed_at: DateTime<Utc>) -> Result<Value, HistorizeError> {
    let root = as_record(typed)?;
    let stamp = Value::String(iso(observed_at));
    let mut out = Map::with_capacity(root.len());
    for (key, value) in root {
        let prepared = if is_identity_key(key) {
            value.clone()
        } else {
            wrap(value, key, &stamp)?
        };
        out.insert(key.clone(), prepared);
    }
    Ok(Value::Object(out))
}

fn wrap(value: &Value, at: &str, stamp: &Value) -> Result<Value, HistorizeError> {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let path = join(at, key);
                if is_identity_key(key) {
                    return Err(HistorizeError::NestedIdentity { path });
                }
                out.insert(key.clone(), wrap(child, &path, stamp)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| wrap(item, &join(at, &i.to_string()), stamp))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        scalar => Ok(json!([{ OBSERVED_AT: stamp, VALUE: scalar }])),
    }
}

/// An object holding exactly `observedAt` and `value`.
pub fn is_history_entry(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 2 && map.contains_key(OBSERVED_AT) && map.contains_key(VALUE)
        }
        _ => false,
    }
}

/// A freshly prepared history leaf: a one-entry history list.
pub fn is_history_leaf(value: &Value) -> bool {
    matches!(value, Value::Array(items) if items.len() == 1 && is_history_entry(&items[0]))
}

/// A stored history list: non-empty, every element a history entry, latest
/// first.
fn is_history_list(value: &Value) -> bool {
    matches!(value, Value::Array(items) if !items.is_empty() && items.iter().all(is_history_entry))
}

/// The three operation groups derived from one historized record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteSet {
    pub base_upsert: WriteOp,
    pub array_init_ops: Vec<WriteOp>,
    pub append_ops: Vec<WriteOp>,
}

impl WriteSet {
    /// All ops in submission order: base upsert, array inits, appends.
    pub fn into_ops(self) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());
        ops.push(self.base_upsert);
        ops.extend(self.array_init_ops);
        ops.extend(self.append_ops);
        ops
    }

    pub fn op_count(&self) -> usize {
        1 + self.array_init_ops.len() + self.append_ops.len()
    }

    pub fn identity(&self) -> &Map<String, Value> {
        &self.base_upsert.filter.identity
    }

    /// Mongo-style rendering of the three groups.
    pub fn to_json(&self) -> Value {
        json!({
            "base_upsert": self.base_upsert.to_json(),
            "array_init_ops": self.array_init_ops.iter().map(WriteOp::to_json).collect::<Vec<_>>(),
            "append_ops": self.append_ops.iter().map(WriteOp::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Derive the write-set of a historized record.
pub fn build_write_set(historized: &Value) -> Result<WriteSet, HistorizeError> {
    let root = as_record(historized)?;
    let identity: Map<String, Value> = root
        .iter()
        .filter(|(k, _)| is_identity_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut set = WriteSet {
        base_upsert: WriteOp {
            filter: Filter::identity(identity.clone()),
            update: Update::Set(identity.clone()),
            upsert: true,
        },
        array_init_ops: Vec::new(),
        append_ops: Vec::new(),
    };
    for (key, value) in root.iter().filter(|(k, _)| !is_identity_key(k)) {
        collect_ops(value, key, &identity, &mut set)?;
    }
    Ok(set)
}

fn collect_ops(
    value: &Value,
    at: &str,
    identity: &Map<String, Value>,
    set: &mut WriteSet,
) -> Result<(), HistorizeError> {
    match value {
        _ if is_history_leaf(value) => {
            let entry = value[0].clone();
            set.append_ops.push(WriteOp {
                filter: Filter::guarded(
                    identity.clone(),
                    Guard::LatestDiffers {
                        path: at.to_string(),
                        value: entry[VALUE].clone(),
                    },
                ),
                update: Update::PushFront {
                    path: at.to_string(),
                    entry,
                },
                upsert: false,
            });
        }
        Value::Array(items) => {
            let mut init = Map::new();
            init.insert(at.to_string(), Value::Array(Vec::new()));
            set.array_init_ops.push(WriteOp {
                filter: Filter::guarded(identity.clone(), Guard::Missing { path: at.to_string() }),
                update: Update::Set(init),
                upsert: false,
            });
            for (i, item) in items.iter().enumerate() {
                collect_ops(item, &join(at, &i.to_string()), identity, set)?;
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let path = join(at, key);
                if is_identity_key(key) {
                    return Err(HistorizeError::NestedIdentity { path });
                }
                collect_ops(child, &path, identity, set)?;
            }
        }
        _ => {
            return Err(HistorizeError::UnhistorizedLeaf {
                path: at.to_string(),
            })
        }
    }
    Ok(())
}

/// Flatten a historized or stored record into `path → latest value`.
///
/// Identity fields keep their value; history lists contribute their first
/// (latest) entry's value.
pub fn flatten(record: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(record, "", &mut out);
    out
}

fn flatten_into(value: &Value, at: &str, out: &mut Map<String, Value>) {
    match value {
        _ if is_history_list(value) => {
            out.insert(at.to_string(), value[0][VALUE].clone());
        }
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, &join(at, key), out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(item, &join(at, &i.to_string()), out);
            }
        }
        scalar => {
            out.insert(at.to_string(), scalar.clone());
        }
    }
}

fn as_record(value: &Value) -> Result<&Map<String, Value>, HistorizeError> {
    value.as_object().ok_or(HistorizeError::NotAnObject {
        found: kind_of(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::{apply_op, Applied};
    use chrono::TimeZone;

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 9, 15, 0).unwrap()
    }

    fn t2() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 21, 9, 15, 0).unwrap()
    }

    #[test]
    fn test_price_scenario() {
        let historized = prepare(&json!({ "@id": "x1", "price": 12.5 }), t1()).unwrap();
        assert_eq!(
            historized,
            json!({
                "@id": "x1",
                "price": [{ "observedAt": "2024-05-20T09:15:00.000Z", "value": 12.5 }]
            })
        );
    }

    #[test]
    fn test_prepare_recurses_into_containers() {
        let historized = prepare(
            &json!({ "@id": 1, "shop": { "name": "A" }, "tags": ["x"] }),
            t1(),
        )
        .unwrap();
        assert!(is_history_leaf(&historized["shop"]["name"]));
        assert!(is_history_leaf(&historized["tags"][0]));
        assert_eq!(historized["@id"], json!(1));
    }

    #[test]
    fn test_prepare_rejects_nested_identity_and_non_objects() {
        assert_eq!(
            prepare(&json!({ "a": { "@id": 1 } }), t1()),
            Err(HistorizeError::NestedIdentity {
                path: "a.@id".into()
            })
        );
        assert_eq!(
            prepare(&json!([1]), t1()),
            Err(HistorizeError::NotAnObject { found: "array" })
        );
    }

    #[test]
    fn test_write_set_groups() {
        let typed = json!({
            "@id": "x1",
            "price": 12.5,
            "items": [{ "sku": "a" }, { "sku": "b" }]
        });
        let set = build_write_set(&prepare(&typed, t1()).unwrap()).unwrap();

        assert!(set.base_upsert.upsert);
        assert_eq!(set.base_upsert.filter.guard, None);
        assert_eq!(
            set.base_upsert.update,
            Update::Set(set.identity().clone())
        );

        assert_eq!(set.array_init_ops.len(), 1);
        assert_eq!(
            set.array_init_ops[0].filter.guard,
            Some(Guard::Missing {
                path: "items".into()
            })
        );

        let paths: Vec<&str> = set
            .append_ops
            .iter()
            .map(|op| match &op.update {
                Update::PushFront { path, .. } => path.as_str(),
                other => panic!("unexpected update {:?}", other),
            })
            .collect();
        assert_eq!(paths, vec!["price", "items.0.sku", "items.1.sku"]);
        assert!(set.append_ops.iter().all(|op| !op.upsert));

        let ops = set.into_ops();
        assert_eq!(ops.len(), 5);
        assert!(ops[0].upsert);
    }

    #[test]
    fn test_unhistorized_leaf_is_rejected() {
        assert_eq!(
            build_write_set(&json!({ "@id": 1, "price": 3 })),
            Err(HistorizeError::UnhistorizedLeaf {
                path: "price".into()
            })
        );
    }

    fn apply_all(doc: &mut Option<Value>, ops: &[WriteOp]) -> Vec<Applied> {
        ops.iter().map(|op| apply_op(doc, op).unwrap()).collect()
    }

    #[test]
    fn test_unchanged_rerun_appends_nothing() {
        let typed = json!({ "@id": "x1", "price": 12.5, "items": [{ "sku": "a" }] });
        let mut doc = None;

        let first = build_write_set(&prepare(&typed, t1()).unwrap()).unwrap();
        apply_all(&mut doc, &first.into_ops());
        let after_first = doc.clone();

        let second = build_write_set(&prepare(&typed, t2()).unwrap()).unwrap();
        assert_eq!(second.append_ops.len(), 2);
        let applied = apply_all(&mut doc, &second.into_ops());
        assert_eq!(applied[0], Applied::Matched { modified: false });
        assert!(applied[1..].iter().all(|a| *a == Applied::Unmatched));
        assert_eq!(doc, after_first);
        assert_eq!(doc.unwrap()["price"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_changed_value_is_prepended() {
        let mut doc = None;
        let first = build_write_set(&prepare(&json!({ "@id": "x1", "price": 12.5 }), t1()).unwrap())
            .unwrap();
        apply_all(&mut doc, &first.into_ops());
        let second = build_write_set(&prepare(&json!({ "@id": "x1", "price": 13 }), t2()).unwrap())
            .unwrap();
        apply_all(&mut doc, &second.into_ops());

        let stored = doc.unwrap();
        assert_eq!(
            stored["price"],
            json!([
                { "observedAt": "2024-05-21T09:15:00.000Z", "value": 13 },
                { "observedAt": "2024-05-20T09:15:00.000Z", "value": 12.5 }
            ])
        );
        assert_eq!(flatten(&stored).get("price"), Some(&json!(13)));
    }

    #[test]
    fn test_array_init_keeps_arrays_as_arrays() {
        let mut doc = None;
        let set = build_write_set(
            &prepare(&json!({ "@id": "x1", "items": [{ "sku": "a" }] }), t1()).unwrap(),
        )
        .unwrap();
        apply_all(&mut doc, &set.into_ops());
        assert!(doc.unwrap()["items"].is_array());
    }

    #[test]
    fn test_flatten_snapshot() {
        let historized = prepare(
            &json!({ "@id": "x1", "price": 12.5, "items": [{ "sku": "a" }] }),
            t1(),
        )
        .unwrap();
        let flat = flatten(&historized);
        assert_eq!(flat.get("@id"), Some(&json!("x1")));
        assert_eq!(flat.get("price"), Some(&json!(12.5)));
        assert_eq!(flat.get("items.0.sku"), Some(&json!("a")));
        assert_eq!(flat.len(), 3);
    }
}
