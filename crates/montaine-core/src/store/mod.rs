//! Storage abstraction for Montaine.
//!
//! The [`Store`] trait is the persistence collaborator of the pipeline: it
//! executes write batches against named collections and keeps the run
//! history. Implementations must be `Send + Sync` so concurrent runs can
//! share one store.
//!
//! # Batch semantics
//!
//! [`bulk_write`](Store::bulk_write) applies its ops in order and atomically:
//! either every op is evaluated and its effect committed, or none is. Guards
//! (`$exists: false`, latest value `$ne`) are evaluated against the record
//! as it stands inside the batch, so two runs racing on one identity cannot
//! both append the same value.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::RunHistoryEntry;
use crate::write::{BulkWriteResult, WriteOp};

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`bulk_write`](Store::bulk_write) | Apply an ordered batch of write ops |
/// | [`find_one`](Store::find_one) | Fetch the record stored under an identity |
/// | [`insert_run`](Store::insert_run) | Append a run history entry |
/// | [`list_runs`](Store::list_runs) | Latest runs of an integration |
#[async_trait]
pub trait Store: Send + Sync {
    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<BulkWriteResult>;

    async fn find_one(
        &self,
        collection: &str,
        identity: &Map<String, Value>,
    ) -> Result<Option<Value>>;

    async fn insert_run(&self, entry: &RunHistoryEntry) -> Result<()>;

    /// Most recent first.
    async fn list_runs(&self, integration: &str, limit: i64) -> Result<Vec<RunHistoryEntry>>;
}
