//! In-memory [`Store`] implementation for tests and offline runs.
//!
//! Records live in a `HashMap` keyed by `(collection, identity key)` behind
//! `std::sync::RwLock`. A batch holds the write lock for its whole duration,
//! which makes it atomic with respect to other batches.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::RunHistoryEntry;
use crate::write::{Batch, BulkWriteResult, Filter, WriteOp};

use super::Store;

/// In-memory store.
pub struct InMemoryStore {
    records: RwLock<HashMap<(String, String), Value>>,
    runs: RwLock<Vec<RunHistoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
        }
    }

    /// Number of records stored in `collection`.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.keys().filter(|(c, _)| c == collection).count())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl Store for InMemoryStore {
    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<BulkWriteResult> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let mut batch = Batch::new();
        for op in ops {
            let key = op.filter.identity_key();
            if !batch.is_loaded(&key) {
                let stored = records.get(&(collection.to_string(), key.clone())).cloned();
                batch.load(key, op.filter.identity.clone(), stored);
            }
            batch.apply(op)?;
        }
        // Nothing is written until every op applied cleanly.
        let (result, changed) = batch.finish();
        for record in changed {
            if let Some(doc) = record.doc {
                records.insert((collection.to_string(), record.key), doc);
            }
        }
        Ok(result)
    }

    async fn find_one(
        &self,
        collection: &str,
        identity: &Map<String, Value>,
    ) -> Result<Option<Value>> {
        let key = Filter::identity(identity.clone()).identity_key();
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&(collection.to_string(), key)).cloned())
    }

    async fn insert_run(&self, entry: &RunHistoryEntry) -> Result<()> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        runs.push(entry.clone());
        Ok(())
    }

    async fn list_runs(&self, integration: &str, limit: i64) -> Result<Vec<RunHistoryEntry>> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        let mut matching: Vec<RunHistoryEntry> = runs
            .iter()
            .filter(|r| r.integration == integration)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}
