//! Backend write operations and their evaluation.
//!
//! A [`WriteOp`] is a `{filter, update, upsert}` triple in the style of a
//! document-store bulk write. Ops render to Mongo-style JSON for logs and run
//! history:
//!
//! ```text
//! {"filter": {"@id": "x1", "price.0.value": {"$ne": 12.5}},
//!  "update": {"$push": {"price": {"$each": [{...}], "$position": 0}}},
//!  "upsert": false}
//! ```
//!
//! Stores do not interpret that JSON. They stage the records a batch touches
//! in a [`Batch`], which evaluates every guard against the staged record and
//! applies the update in op order. Committing the staged records (or none of
//! them) is up to the store.

use std::collections::{BTreeMap, HashMap};

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::kind_of;
use crate::path::{get_path, get_path_mut, join, set_path};

/// Extra condition on top of the identity match.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// `path` must not exist in the stored record.
    Missing { path: String },
    /// The latest history entry at `path` must not hold `value`.
    LatestDiffers { path: String, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Top-level identity fields, matched by equality.
    pub identity: Map<String, Value>,
    pub guard: Option<Guard>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// `$set` every path to its value.
    Set(Map<String, Value>),
    /// `$push` `entry` at the front of the array at `path`.
    PushFront { path: String, entry: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub filter: Filter,
    pub update: Update,
    pub upsert: bool,
}

/// Outcome of evaluating one op against one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Unmatched,
    Matched { modified: bool },
    Upserted,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("cannot push to '{path}': stored value is {found}, not an array")]
    NotAnArray { path: String, found: &'static str },
}

/// Counters summed over every op of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkWriteResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

impl BulkWriteResult {
    pub fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Unmatched => {}
            Applied::Matched { modified } => {
                self.matched += 1;
                if modified {
                    self.modified += 1;
                }
            }
            Applied::Upserted => self.upserted += 1,
        }
    }
}

impl Filter {
    pub fn identity(identity: Map<String, Value>) -> Self {
        Self {
            identity,
            guard: None,
        }
    }

    pub fn guarded(identity: Map<String, Value>, guard: Guard) -> Self {
        Self {
            identity,
            guard: Some(guard),
        }
    }

    /// Canonical key of the identity: compact JSON with sorted keys.
    ///
    /// Two filters address the same record iff their keys are equal.
    pub fn identity_key(&self) -> String {
        canonical(&Value::Object(self.identity.clone())).to_string()
    }

    /// Whether a stored record satisfies this filter.
    pub fn matches(&self, doc: &Value) -> bool {
        let identity_ok = self
            .identity
            .iter()
            .all(|(key, expected)| doc.get(key) == Some(expected));
        identity_ok
            && match &self.guard {
                None => true,
                Some(Guard::Missing { path }) => get_path(doc, path).is_none(),
                Some(Guard::LatestDiffers { path, value }) => {
                    get_path(doc, &join(path, "0.value")) != Some(value)
                }
            }
    }

    pub fn to_json(&self) -> Value {
        let mut out = self.identity.clone();
        match &self.guard {
            None => {}
            Some(Guard::Missing { path }) => {
                out.insert(path.clone(), json!({ "$exists": false }));
            }
            Some(Guard::LatestDiffers { path, value }) => {
                out.insert(join(path, "0.value"), json!({ "$ne": value }));
            }
        }
        Value::Object(out)
    }
}

impl Update {
    pub fn to_json(&self) -> Value {
        match self {
            Update::Set(fields) => json!({ "$set": fields }),
            Update::PushFront { path, entry } => {
                let mut push = Map::new();
                push.insert(path.clone(), json!({ "$each": [entry], "$position": 0 }));
                json!({ "$push": push })
            }
        }
    }

    fn apply(&self, doc: &mut Value) -> Result<(), ApplyError> {
        match self {
            Update::Set(fields) => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            Update::PushFront { path, entry } => match get_path_mut(doc, path) {
                Some(Value::Array(items)) => items.insert(0, entry.clone()),
                Some(other) => {
                    return Err(ApplyError::NotAnArray {
                        path: path.clone(),
                        found: kind_of(other),
                    })
                }
                None => set_path(doc, path, Value::Array(vec![entry.clone()])),
            },
        }
        Ok(())
    }
}

impl WriteOp {
    pub fn to_json(&self) -> Value {
        json!({
            "filter": self.filter.to_json(),
            "update": self.update.to_json(),
            "upsert": self.upsert,
        })
    }
}

impl Serialize for WriteOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Evaluate `op` against the record stored under its identity.
///
/// `doc` is `None` when no record exists. An upsert only creates a record
/// when none exists; the new record starts from the identity fields. A
/// record that exists but fails the guard is left alone.
pub fn apply_op(doc: &mut Option<Value>, op: &WriteOp) -> Result<Applied, ApplyError> {
    match doc {
        Some(stored) if op.filter.matches(stored) => {
            let mut updated = stored.clone();
            op.update.apply(&mut updated)?;
            let modified = updated != *stored;
            *stored = updated;
            Ok(Applied::Matched { modified })
        }
        Some(_) => Ok(Applied::Unmatched),
        None if op.upsert => {
            let mut created = Value::Object(op.filter.identity.clone());
            op.update.apply(&mut created)?;
            *doc = Some(created);
            Ok(Applied::Upserted)
        }
        None => Ok(Applied::Unmatched),
    }
}

/// A record loaded into a [`Batch`].
#[derive(Debug, Clone)]
pub struct StagedRecord {
    pub key: String,
    pub identity: Map<String, Value>,
    pub doc: Option<Value>,
    /// The record existed before the batch.
    pub existed: bool,
    dirty: bool,
}

/// Records touched by one bulk write, staged until the store commits them.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<StagedRecord>,
    index: HashMap<String, usize>,
    result: BulkWriteResult,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Stage the currently stored record for `key`, or `None` if absent.
    pub fn load(&mut self, key: String, identity: Map<String, Value>, doc: Option<Value>) {
        if self.is_loaded(&key) {
            return;
        }
        self.index.insert(key.clone(), self.records.len());
        self.records.push(StagedRecord {
            key,
            identity,
            existed: doc.is_some(),
            doc,
            dirty: false,
        });
    }

    /// Apply `op` to its staged record. Records that were never loaded are
    /// treated as absent.
    pub fn apply(&mut self, op: &WriteOp) -> Result<Applied, ApplyError> {
        let key = op.filter.identity_key();
        if !self.is_loaded(&key) {
            self.load(key.clone(), op.filter.identity.clone(), None);
        }
        let slot = self.index[&key];
        let record = &mut self.records[slot];
        let applied = apply_op(&mut record.doc, op)?;
        if matches!(applied, Applied::Upserted | Applied::Matched { modified: true }) {
            record.dirty = true;
        }
        self.result.record(applied);
        Ok(applied)
    }

    /// Counters and the records that changed.
    pub fn finish(self) -> (BulkWriteResult, Vec<StagedRecord>) {
        let changed = self.records.into_iter().filter(|r| r.dirty).collect();
        (self.result, changed)
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
