use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Historized records, one row per (collection, identity)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            identity_hash TEXT NOT NULL,
            identity_json TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, identity_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_history (
            id TEXT PRIMARY KEY,
            integration TEXT NOT NULL,
            acting_user TEXT,
            mode TEXT NOT NULL,
            status INTEGER NOT NULL,
            stage TEXT,
            payload TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Alerts queued for an external mail relay
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_outbox (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            recipient TEXT NOT NULL,
            context TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            sent_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_run_history_integration ON run_history(integration, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alert_outbox_pending ON alert_outbox(sent_at)")
        .execute(pool)
        .await?;

    Ok(())
}
