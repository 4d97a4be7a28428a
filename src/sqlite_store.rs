//! SQLite-backed [`Store`] implementation.
//!
//! Records are stored as JSON bodies in the `records` table, keyed by
//! collection and the SHA-256 of the canonical identity. A bulk write runs
//! inside one `BEGIN IMMEDIATE` transaction: records are read, every op's
//! guard is evaluated against them, and the changed records are written
//! back before the commit. Dropping an uncommitted transaction rolls it
//! back, so an aborted run never leaves a pooled connection mid-transaction. Concurrent batches serialize on SQLite's write
//! lock, so the append guard acts as a compare-and-set.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection, SqlitePool};

use montaine_core::models::{RunHistoryEntry, RunMode};
use montaine_core::store::Store;
use montaine_core::write::{Batch, BulkWriteResult, Filter, WriteOp};

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database, creating tables if needed.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn identity_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn load_body(
    conn: &mut SqliteConnection,
    collection: &str,
    key: &str,
) -> Result<Option<Value>> {
    let body: Option<String> =
        sqlx::query_scalar("SELECT body FROM records WHERE collection = ? AND identity_hash = ?")
            .bind(collection)
            .bind(identity_hash(key))
            .fetch_optional(&mut *conn)
            .await?;
    body.map(|b| serde_json::from_str(&b))
        .transpose()
        .with_context(|| format!("Corrupt record body in '{}' for {}", collection, key))
}

async fn write_batch(
    conn: &mut SqliteConnection,
    collection: &str,
    ops: &[WriteOp],
) -> Result<BulkWriteResult> {
    let mut batch = Batch::new();
    for op in ops {
        let key = op.filter.identity_key();
        if !batch.is_loaded(&key) {
            let stored = load_body(conn, collection, &key).await?;
            batch.load(key, op.filter.identity.clone(), stored);
        }
        batch.apply(op)?;
    }

    let (result, changed) = batch.finish();
    let now = Utc::now().timestamp();
    for record in changed {
        let Some(doc) = record.doc else { continue };
        sqlx::query(
            r#"
            INSERT INTO records (collection, identity_hash, identity_json, body, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, identity_hash) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(identity_hash(&record.key))
        .bind(&record.key)
        .bind(doc.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(result)
}

#[async_trait]
impl Store for SqliteStore {
    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<BulkWriteResult> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        match write_batch(&mut *tx, collection, ops).await {
            Ok(result) => {
                // A failed commit drops the transaction, which rolls it back.
                tx.commit()
                    .await
                    .with_context(|| format!("commit of {} write ops failed", ops.len()))?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(collection, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn find_one(
        &self,
        collection: &str,
        identity: &Map<String, Value>,
    ) -> Result<Option<Value>> {
        let key = Filter::identity(identity.clone()).identity_key();
        let mut conn = self.pool.acquire().await?;
        load_body(&mut conn, collection, &key).await
    }

    async fn insert_run(&self, entry: &RunHistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_history (id, integration, acting_user, mode, status, stage,
                                     payload, started_at, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.integration)
        .bind(&entry.acting_user)
        .bind(entry.mode.as_str())
        .bind(entry.status)
        .bind(&entry.stage)
        .bind(entry.payload.to_string())
        .bind(entry.started_at.timestamp_millis())
        .bind(entry.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, integration: &str, limit: i64) -> Result<Vec<RunHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, integration, acting_user, mode, status, stage, payload, started_at, duration_ms
            FROM run_history
            WHERE integration = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(integration)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let mode: String = row.get("mode");
                let payload: String = row.get("payload");
                let started_at: i64 = row.get("started_at");
                Ok(RunHistoryEntry {
                    id: row.get("id"),
                    integration: row.get("integration"),
                    acting_user: row.get("acting_user"),
                    mode: RunMode::parse(&mode)
                        .ok_or_else(|| anyhow!("Unknown run mode '{}'", mode))?,
                    status: row.get("status"),
                    stage: row.get("stage"),
                    payload: serde_json::from_str(&payload)?,
                    started_at: DateTime::from_timestamp_millis(started_at)
                        .ok_or_else(|| anyhow!("Invalid started_at {}", started_at))?,
                    duration_ms: row.get("duration_ms"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use montaine_core::historize::{build_write_set, prepare};
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> SqliteStore {
        let config = crate::config::parse_config(
            &format!("[db]\npath = \"{}/test.sqlite\"\n", tmp.path().display()),
            tmp.path(),
        )
        .unwrap();
        SqliteStore::open(&config).await.unwrap()
    }

    fn ops_for(typed: Value, day: u32) -> Vec<WriteOp> {
        let at = Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap();
        build_write_set(&prepare(&typed, at).unwrap())
            .unwrap()
            .into_ops()
    }

    fn identity(id: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("@id".into(), json!(id));
        m
    }

    #[tokio::test]
    async fn test_bulk_write_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let first = store
            .bulk_write("prices", &ops_for(json!({ "@id": "x1", "price": 12.5 }), 1))
            .await
            .unwrap();
        assert_eq!(first.upserted, 1);

        let second = store
            .bulk_write("prices", &ops_for(json!({ "@id": "x1", "price": 12.5 }), 2))
            .await
            .unwrap();
        assert_eq!(second.modified, 0);

        store
            .bulk_write("prices", &ops_for(json!({ "@id": "x1", "price": 9 }), 3))
            .await
            .unwrap();

        let doc = store
            .find_one("prices", &identity("x1"))
            .await
            .unwrap()
            .unwrap();
        let history = doc["price"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["value"], json!(9));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let mut ops = ops_for(json!({ "@id": "x2", "price": 1 }), 1);
        ops.push(WriteOp {
            filter: Filter::identity(identity("x2")),
            update: montaine_core::write::Update::PushFront {
                path: "@id".into(),
                entry: json!({}),
            },
            upsert: false,
        });
        assert!(store.bulk_write("prices", &ops).await.is_err());
        assert!(store
            .find_one("prices", &identity("x2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_store_usable_after_failed_batch() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let mut ops = ops_for(json!({ "@id": "x4", "price": 1 }), 1);
        ops.push(WriteOp {
            filter: Filter::identity(identity("x4")),
            update: montaine_core::write::Update::PushFront {
                path: "@id".into(),
                entry: json!({}),
            },
            upsert: false,
        });
        for _ in 0..3 {
            assert!(store.bulk_write("prices", &ops).await.is_err());
        }

        let result = store
            .bulk_write("prices", &ops_for(json!({ "@id": "x4", "price": 2 }), 2))
            .await
            .unwrap();
        assert_eq!(result.upserted, 1);
        store.close().await;

        // Committed, so a fresh connection sees it.
        let reopened = open_store(&tmp).await;
        let doc = reopened
            .find_one("prices", &identity("x4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["price"][0]["value"], json!(2));
    }

    #[tokio::test]
    async fn test_unchanged_float_appends_once() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let lng = montaine_core::coerce::parse_number("11238.503724789001").unwrap();

        for day in [1, 2, 3] {
            store
                .bulk_write("places", &ops_for(json!({ "@id": "x1", "lng": lng }), day))
                .await
                .unwrap();
        }

        let doc = store
            .find_one("places", &identity("x1"))
            .await
            .unwrap()
            .unwrap();
        let history = doc["lng"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["value"], lng);
    }

    #[tokio::test]
    async fn test_concurrent_batches_append_once() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open_store(&tmp).await);
        store
            .bulk_write("prices", &ops_for(json!({ "@id": "x3", "price": 1 }), 1))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .bulk_write("prices", &ops_for(json!({ "@id": "x3", "price": 2 }), 2))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = store
            .find_one("prices", &identity("x3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["price"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_history_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        for (i, status) in [true, false].iter().enumerate() {
            store
                .insert_run(&RunHistoryEntry {
                    id: format!("r{}", i),
                    integration: "prices".into(),
                    acting_user: Some("ana".into()),
                    mode: RunMode::Auto,
                    status: *status,
                    stage: (!status).then(|| "Fetching".to_string()),
                    payload: json!({ "n": i }),
                    started_at: Utc.with_ymd_and_hms(2024, 5, 1 + i as u32, 0, 0, 0).unwrap(),
                    duration_ms: 10,
                })
                .await
                .unwrap();
        }
        let runs = store.list_runs("prices", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "r1");
        assert!(!runs[0].status);
        assert_eq!(runs[0].stage.as_deref(), Some("Fetching"));
        assert_eq!(runs[1].payload, json!({ "n": 0 }));
        assert_eq!(runs[1].acting_user.as_deref(), Some("ana"));
        assert!(store.list_runs("other", 10).await.unwrap().is_empty());
    }
}
