//! Failure alerts.
//!
//! The pipeline notifies an integration's `alert_email` through a [`Mailer`]
//! when a run fails. Montaine does not speak SMTP: [`LogMailer`] emits the
//! alert as a structured log line, [`OutboxMailer`] queues it in the
//! `alert_outbox` table for an external relay to deliver.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    RunFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::RunFailed => "run_failed",
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_alert(&self, kind: AlertKind, recipient: &str, context: &Value) -> Result<()>;
}

/// Writes alerts to the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_alert(&self, kind: AlertKind, recipient: &str, context: &Value) -> Result<()> {
        tracing::warn!(
            kind = kind.as_str(),
            recipient,
            context = %context,
            "alert"
        );
        Ok(())
    }
}

/// Queues alerts in `alert_outbox`.
pub struct OutboxMailer {
    pool: SqlitePool,
}

impl OutboxMailer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send_alert(&self, kind: AlertKind, recipient: &str, context: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO alert_outbox (id, kind, recipient, context, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind.as_str())
        .bind(recipient)
        .bind(context.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
