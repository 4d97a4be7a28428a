//! `montaine run` / `montaine auto`.
//!
//! Wires the configured store, fetcher and mailer into a [`Pipeline`],
//! runs one integration (or all of them) and prints the outcome.

use std::sync::Arc;

use anyhow::Result;

use montaine_core::models::RunMode;
use montaine_core::store::Store;

use crate::config::{AlertMode, Config};
use crate::fetch::HttpFetcher;
use crate::mailer::{LogMailer, Mailer, OutboxMailer};
use crate::pipeline::{Pipeline, RunOutcome};
use crate::progress::ProgressMode;
use crate::sqlite_store::SqliteStore;

/// Build a pipeline backed by the configured SQLite database.
pub async fn build_pipeline(config: &Config, progress: ProgressMode) -> Result<Pipeline> {
    let store = SqliteStore::open(config).await?;
    let mailer: Arc<dyn Mailer> = match config.alerts.mode {
        AlertMode::Log => Arc::new(LogMailer),
        AlertMode::Outbox => Arc::new(OutboxMailer::new(store.pool().clone())),
    };
    let store: Arc<dyn Store> = Arc::new(store);
    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    Ok(Pipeline::new(store, fetcher, mailer).with_reporter(progress.reporter()))
}

/// Run `target` (an integration name, or `all`). Returns whether every run
/// succeeded.
pub async fn run(
    config: &Config,
    target: &str,
    user: Option<String>,
    mode: RunMode,
    json: bool,
    progress: ProgressMode,
) -> Result<bool> {
    let integrations = if target == "all" {
        config.integrations.values().cloned().collect::<Vec<_>>()
    } else {
        vec![config.integration(target)?.clone()]
    };
    if integrations.is_empty() {
        println!("No integrations configured.");
        return Ok(true);
    }

    let pipeline = Arc::new(build_pipeline(config, progress).await?);
    let outcomes = if integrations.len() == 1 {
        let integration = &integrations[0];
        vec![match mode {
            RunMode::Manual => pipeline.run(integration, user.as_deref()).await,
            RunMode::Auto => pipeline.run_auto(integration, user.as_deref()).await,
        }]
    } else {
        pipeline.run_all(integrations, user, mode).await
    };

    let ok = outcomes.iter().all(RunOutcome::is_success);
    if json {
        let rendered: Vec<_> = outcomes.iter().map(RunOutcome::to_json).collect();
        let rendered = if rendered.len() == 1 {
            rendered.into_iter().next().unwrap_or_default()
        } else {
            serde_json::Value::Array(rendered)
        };
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    } else {
        for outcome in &outcomes {
            print_outcome(outcome)?;
        }
    }
    Ok(ok)
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
    let entry = &outcome.entry;
    println!("run {} ({})", entry.integration, entry.mode.as_str());
    println!("  run id: {}", entry.id);
    match (&outcome.report, &outcome.error) {
        (Some(report), _) => {
            println!("  records: {}", report.snapshot.len());
            if let Some(persisted) = &report.persisted {
                println!(
                    "  matched: {}  modified: {}  upserted: {}",
                    persisted.matched, persisted.modified, persisted.upserted
                );
            } else {
                println!("{}", serde_json::to_string_pretty(&report.typed)?);
            }
        }
        (None, Some(error)) => {
            println!("  failed at: {}", error.stage().as_str());
            println!(
                "{}",
                serde_json::to_string_pretty(&error.to_error_object())?
            );
        }
        (None, None) => {}
    }
    println!("  duration: {} ms", entry.duration_ms);
    if !outcome.recorded {
        println!("  warning: run history entry was not stored");
    }
    println!("{}", if outcome.is_success() { "ok" } else { "failed" });
    Ok(())
}
