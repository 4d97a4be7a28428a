//! Offline transformation of a saved source document.
//!
//! Runs mapping, typing and historization for one integration against a
//! local JSON file and prints every intermediate document. Nothing is
//! fetched and nothing is persisted, which makes this the way to iterate on
//! schemas.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use montaine_core::coerce::parse_datetime;
use montaine_core::mapper::map_document;
use montaine_core::typer::{type_document, TypingContext};

use crate::config::Config;
use crate::config::IntegrationConfig;
use crate::pipeline::{prepare_records, project, PipelineError, Schemas};

/// Every stage output for `source`, as one JSON document.
pub fn transform_document(
    integration: &IntegrationConfig,
    source: &Value,
    observed_at: DateTime<Utc>,
) -> Result<Value, PipelineError> {
    let schemas = Schemas::parse(integration)?;
    let projected = project(source, integration.result_path.as_deref())?;
    let mapped = match &schemas.mapping {
        Some(schema) => map_document(&projected, schema)?,
        None => projected,
    };
    let typed = match &schemas.typing {
        Some(schema) => type_document(&mapped, schema, &TypingContext::at(observed_at))?,
        None => mapped.clone(),
    };
    let records = prepare_records(&typed, observed_at)?;

    Ok(json!({
        "observed_at": montaine_core::coerce::iso(observed_at),
        "mapped": mapped,
        "typed": typed,
        "historized": records.iter().map(|r| r.historized.clone()).collect::<Vec<_>>(),
        "write_sets": records.iter().map(|r| r.write_set.to_json()).collect::<Vec<_>>(),
    }))
}

pub fn run_transform(
    config: &Config,
    name: &str,
    input: &Path,
    observed_at: Option<&str>,
) -> Result<()> {
    let integration = config.integration(name)?;
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read input file: {}", input.display()))?;
    let source: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", input.display()))?;

    let observed_at = match observed_at {
        Some(raw) => parse_datetime(&Value::String(raw.to_string()))
            .with_context(|| format!("Invalid --observed-at timestamp: '{}'", raw))?,
        None => Utc::now(),
    };

    let output = transform_document(integration, &source, observed_at)
        .map_err(|e| anyhow::anyhow!("{} ({})", e, e.code()))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
