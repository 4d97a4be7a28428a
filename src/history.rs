//! Read side of the store: run history and stored records.

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use montaine_core::historize::flatten;
use montaine_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Print the most recent runs of an integration, newest first.
pub async fn show_history(config: &Config, name: &str, limit: i64) -> Result<()> {
    let integration = config.integration(name)?;
    let store = SqliteStore::open(config).await?;
    let runs = store.list_runs(&integration.name, limit).await?;
    store.close().await;

    if runs.is_empty() {
        println!("No runs recorded for '{}'.", name);
        return Ok(());
    }

    println!(
        "{:<36} {:<24} {:<7} {:<7} {:<12} {:>8} USER",
        "RUN", "STARTED", "MODE", "STATUS", "STAGE", "MS"
    );
    for run in runs {
        println!(
            "{:<36} {:<24} {:<7} {:<7} {:<12} {:>8} {}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.mode.as_str(),
            if run.status { "ok" } else { "failed" },
            run.stage.as_deref().unwrap_or("-"),
            run.duration_ms,
            run.acting_user.as_deref().unwrap_or("-")
        );
        if !run.status {
            if let Some(description) = run.payload.get("description").and_then(Value::as_str) {
                println!("  {}", description);
            }
        }
    }
    Ok(())
}

/// Identity map from `K=V` pairs. Values that parse as JSON keep their type,
/// anything else is a string. Keys get the identity marker when missing.
pub fn identity_from_pairs(pairs: &[(String, String)]) -> Result<Map<String, Value>> {
    if pairs.is_empty() {
        bail!("at least one --id KEY=VALUE is required");
    }
    let mut identity = Map::new();
    for (key, raw) in pairs {
        let key = if key.starts_with('@') {
            key.clone()
        } else {
            format!("@{}", key)
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        identity.insert(key, value);
    }
    Ok(identity)
}

/// Print a stored record with its full history, then its latest values.
pub async fn show_record(config: &Config, name: &str, pairs: &[(String, String)]) -> Result<()> {
    let integration = config.integration(name)?;
    let identity = identity_from_pairs(pairs)?;
    let store = SqliteStore::open(config).await?;
    let record = store.find_one(integration.collection(), &identity).await?;
    store.close().await;

    let Some(record) = record else {
        bail!(
            "no record in '{}' for {}",
            integration.collection(),
            Value::Object(identity)
        );
    };

    println!("{}", serde_json::to_string_pretty(&record)?);
    println!();
    println!("latest:");
    for (path, value) in flatten(&record) {
        println!("  {:<30} {}", path, value);
    }
    Ok(())
}
