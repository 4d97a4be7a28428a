//! Pipeline orchestration.
//!
//! One run takes an integration from its remote source to historized
//! records:
//!
//! ```text
//! Configuring → [Validating] → Fetching → Mapping → Typing
//!             → Preparing → Persisting → Historizing → Done
//! ```
//!
//! Any stage can fail; the run then ends in `Failed`. Stage errors never
//! escape [`Pipeline::run`]: they are recorded in the run history, reported
//! to the alert recipient, and returned inside the [`RunOutcome`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use montaine_core::historize::{build_write_set, flatten, prepare, WriteSet};
use montaine_core::mapper::map_document;
use montaine_core::models::{RunHistoryEntry, RunMode};
use montaine_core::path::get_path;
use montaine_core::store::Store;
use montaine_core::typer::{type_document, TypingContext};
use montaine_core::write::BulkWriteResult;
use montaine_core::{HistorizeError, MappingError, SchemaError, SchemaNode, TypingError};

use crate::config::IntegrationConfig;
use crate::fetch::{FetchRequest, Fetcher, TransportError};
use crate::mailer::{AlertKind, Mailer};
use crate::params::{derive_params, ParamSchema, ValidationError};
use crate::progress::{RunProgressEvent, RunReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Configuring,
    Validating,
    Fetching,
    Mapping,
    Typing,
    Preparing,
    Persisting,
    Historizing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configuring => "configuring",
            Stage::Validating => "validating",
            Stage::Fetching => "fetching",
            Stage::Mapping => "mapping",
            Stage::Typing => "typing",
            Stage::Preparing => "preparing",
            Stage::Persisting => "persisting",
            Stage::Historizing => "historizing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

/// Why a run failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid mapping schema: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Typing(#[from] TypingError),

    #[error(transparent)]
    Historize(#[from] HistorizeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to persist into '{collection}': {message}")]
    Persistence { collection: String, message: String },
}

/// Machine-readable failure for interactive callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorObject {
    pub code: &'static str,
    pub description: String,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Config(_)
            | PipelineError::Schema(_)
            | PipelineError::Typing(TypingError::Schema(_)) => "configuration_error",
            PipelineError::Transport(_) => "transport_error",
            PipelineError::Mapping(_) => "mapping_error",
            PipelineError::Typing(_) => "typing_error",
            PipelineError::Historize(_) => "historize_error",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Persistence { .. } => "persistence_error",
        }
    }

    /// Stage the run was in when this error was raised.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config(_) | PipelineError::Schema(_) => Stage::Configuring,
            PipelineError::Typing(TypingError::Schema(_)) => Stage::Configuring,
            PipelineError::Validation(_) => Stage::Validating,
            PipelineError::Transport(_) => Stage::Fetching,
            PipelineError::Mapping(_) => Stage::Mapping,
            PipelineError::Typing(_) => Stage::Typing,
            PipelineError::Historize(_) => Stage::Preparing,
            PipelineError::Persistence { .. } => Stage::Persisting,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            description: self.to_string(),
        }
    }
}

/// Parsed schemas of one integration.
#[derive(Debug, Clone, Default)]
pub struct Schemas {
    pub mapping: Option<SchemaNode>,
    pub typing: Option<SchemaNode>,
}

impl Schemas {
    pub fn parse(integration: &IntegrationConfig) -> Result<Self, PipelineError> {
        let mapping = integration
            .mapping_schema
            .as_deref()
            .map(SchemaNode::parse_mapping)
            .transpose()?;
        let typing = integration
            .typing_schema
            .as_deref()
            .map(SchemaNode::parse_typing)
            .transpose()?;
        Ok(Self { mapping, typing })
    }
}

/// Sub-document of `response` at `result_path`, or the whole response.
pub fn project(response: &Value, result_path: Option<&str>) -> Result<Value, MappingError> {
    match result_path {
        None | Some("") => Ok(response.clone()),
        Some(path) => get_path(response, path)
            .cloned()
            .ok_or_else(|| MappingError::MissingPath {
                path: path.to_string(),
            }),
    }
}

/// One typed record after historization.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub historized: Value,
    pub write_set: WriteSet,
}

/// Historize every record of a typed document. An array document holds one
/// record per element; anything else is a single record.
pub fn prepare_records(
    typed: &Value,
    observed_at: DateTime<Utc>,
) -> Result<Vec<PreparedRecord>, HistorizeError> {
    let records: Vec<&Value> = match typed {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    records
        .into_iter()
        .map(|record| {
            let historized = prepare(record, observed_at)?;
            let write_set = build_write_set(&historized)?;
            Ok(PreparedRecord {
                historized,
                write_set,
            })
        })
        .collect()
}

/// Intermediate documents of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub params: Map<String, Value>,
    pub source_response: Value,
    pub mapped: Value,
    pub typed: Value,
    /// Rendered write-sets, one per record. Empty when the integration does
    /// not save.
    pub write_sets: Vec<Value>,
    pub persisted: Option<BulkWriteResult>,
    /// Flattened historized records.
    pub snapshot: Vec<Map<String, Value>>,
}

impl RunReport {
    /// Payload stored in the run history.
    fn summary(&self) -> Value {
        json!({
            "params": self.params,
            "records": self.snapshot.len(),
            "persisted": self.persisted,
            "snapshot": self.snapshot,
        })
    }
}

/// Result of one run. `recorded` is false when the history entry could not
/// be stored.
#[derive(Debug)]
pub struct RunOutcome {
    pub entry: RunHistoryEntry,
    pub report: Option<RunReport>,
    pub error: Option<PipelineError>,
    pub recorded: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "entry": self.entry,
            "report": self.report,
            "error": self.error.as_ref().map(PipelineError::to_error_object),
            "recorded": self.recorded,
        })
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    mailer: Arc<dyn Mailer>,
    reporter: Option<Box<dyn RunReporter>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, fetcher: Arc<dyn Fetcher>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            store,
            fetcher,
            mailer,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn RunReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Run with the integration's static parameters.
    pub async fn run(&self, integration: &IntegrationConfig, acting_user: Option<&str>) -> RunOutcome {
        self.execute(integration, acting_user, RunMode::Manual).await
    }

    /// Run with parameters derived from the integration's aggregation
    /// pipeline.
    pub async fn run_auto(
        &self,
        integration: &IntegrationConfig,
        acting_user: Option<&str>,
    ) -> RunOutcome {
        self.execute(integration, acting_user, RunMode::Auto).await
    }

    /// Run several integrations concurrently, one task each. Outcomes are
    /// sorted by integration name.
    pub async fn run_all(
        self: Arc<Self>,
        integrations: Vec<IntegrationConfig>,
        acting_user: Option<String>,
        mode: RunMode,
    ) -> Vec<RunOutcome> {
        let mut tasks = JoinSet::new();
        for integration in integrations {
            let pipeline = Arc::clone(&self);
            let user = acting_user.clone();
            tasks.spawn(async move {
                pipeline
                    .execute(&integration, user.as_deref(), mode)
                    .await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "run task aborted"),
            }
        }
        outcomes.sort_by(|a, b| a.entry.integration.cmp(&b.entry.integration));
        outcomes
    }

    async fn execute(
        &self,
        integration: &IntegrationConfig,
        acting_user: Option<&str>,
        mode: RunMode,
    ) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "run",
            integration = %integration.name,
            run_id = %run_id,
            mode = mode.as_str()
        );
        self.execute_in_span(integration, acting_user, mode, run_id)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        integration: &IntegrationConfig,
        acting_user: Option<&str>,
        mode: RunMode,
        run_id: String,
    ) -> RunOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = self.stages(integration, mode, started_at).await;

        self.enter(integration, Stage::Historizing, None);
        let duration_ms = clock.elapsed().as_millis() as i64;
        let (payload, failed_stage) = match &result {
            Ok(report) => (report.summary(), None),
            Err(e) => (
                json!(e.to_error_object()),
                Some(e.stage().as_str().to_string()),
            ),
        };
        let entry = RunHistoryEntry {
            id: run_id.clone(),
            integration: integration.name.clone(),
            acting_user: acting_user.map(str::to_string),
            mode,
            status: result.is_ok(),
            stage: failed_stage,
            payload,
            started_at,
            duration_ms,
        };

        let recorded = match self.store.insert_run(&entry).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "failed to record run history");
                false
            }
        };

        let (report, error) = match result {
            Ok(report) => {
                self.enter(integration, Stage::Done, None);
                (Some(report), None)
            }
            Err(e) => {
                tracing::error!(
                    stage = e.stage().as_str(),
                    code = e.code(),
                    error = %e,
                    "run failed"
                );
                self.enter(integration, Stage::Failed, None);
                self.alert(integration, &entry, &e).await;
                (None, Some(e))
            }
        };

        if let Some(reporter) = &self.reporter {
            reporter.report(RunProgressEvent::Finished {
                integration: integration.name.clone(),
                ok: error.is_none(),
                duration_ms,
            });
        }

        RunOutcome {
            entry,
            report,
            error,
            recorded,
        }
    }

    async fn stages(
        &self,
        integration: &IntegrationConfig,
        mode: RunMode,
        observed_at: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        self.enter(integration, Stage::Configuring, None);
        let schemas = Schemas::parse(integration)?;

        let params = match mode {
            RunMode::Manual => integration.params.clone(),
            RunMode::Auto => {
                self.enter(integration, Stage::Validating, None);
                auto_params(integration)?
            }
        };

        self.enter(integration, Stage::Fetching, None);
        let request = FetchRequest::for_integration(integration, params.clone());
        let source_response = self.fetcher.fetch(&request).await?;

        let source = project(&source_response, integration.result_path.as_deref())?;
        self.enter(integration, Stage::Mapping, record_count(&source));
        let mapped = match &schemas.mapping {
            Some(schema) => map_document(&source, schema)?,
            None => source,
        };

        self.enter(integration, Stage::Typing, record_count(&mapped));
        let typed = match &schemas.typing {
            Some(schema) => type_document(&mapped, schema, &TypingContext::at(observed_at))?,
            None => mapped.clone(),
        };

        let mut report = RunReport {
            params,
            source_response,
            mapped,
            typed,
            write_sets: Vec::new(),
            persisted: None,
            snapshot: Vec::new(),
        };
        if !integration.save {
            return Ok(report);
        }

        self.enter(integration, Stage::Preparing, record_count(&report.typed));
        let prepared = prepare_records(&report.typed, observed_at)?;
        let mut ops = Vec::new();
        for record in prepared {
            report.write_sets.push(record.write_set.to_json());
            report.snapshot.push(flatten(&record.historized));
            ops.extend(record.write_set.into_ops());
        }

        let collection = integration.collection();
        self.enter(
            integration,
            Stage::Persisting,
            Some(report.snapshot.len() as u64),
        );
        tracing::debug!(collection, ops = ops.len(), "submitting write-set");
        let persisted = self
            .store
            .bulk_write(collection, &ops)
            .await
            .map_err(|e| PipelineError::Persistence {
                collection: collection.to_string(),
                message: format!("{:#}", e),
            })?;
        tracing::info!(
            collection,
            matched = persisted.matched,
            modified = persisted.modified,
            upserted = persisted.upserted,
            "persisted"
        );
        report.persisted = Some(persisted);
        Ok(report)
    }

    fn enter(&self, integration: &IntegrationConfig, stage: Stage, records: Option<u64>) {
        tracing::info!(stage = stage.as_str(), records, "stage");
        if let Some(reporter) = &self.reporter {
            reporter.report(RunProgressEvent::Stage {
                integration: integration.name.clone(),
                stage,
                records,
            });
        }
    }

    async fn alert(&self, integration: &IntegrationConfig, entry: &RunHistoryEntry, error: &PipelineError) {
        let Some(recipient) = integration.alert_email.as_deref() else {
            return;
        };
        let context = json!({
            "integration": integration.name,
            "run_id": entry.id,
            "stage": error.stage().as_str(),
            "error": error.to_error_object(),
            "started_at": entry.started_at,
            "acting_user": entry.acting_user,
        });
        if let Err(e) = self
            .mailer
            .send_alert(AlertKind::RunFailed, recipient, &context)
            .await
        {
            tracing::warn!(recipient, error = %format!("{:#}", e), "failed to send alert");
        }
    }
}

/// Parameters of an auto run: static params overridden by the values
/// derived from the aggregation pipeline, after validation.
fn auto_params(integration: &IntegrationConfig) -> Result<Map<String, Value>, PipelineError> {
    let raw = integration
        .auto_pipeline
        .as_deref()
        .ok_or(ValidationError::NoPipeline)?;
    let pipeline: Value = serde_json::from_str(raw)
        .map_err(|e| PipelineError::Config(format!("auto_pipeline is not valid JSON: {}", e)))?;
    let derived = derive_params(&pipeline)?;
    ParamSchema::generate(&integration.parameters).validate(&derived)?;

    let mut params = integration.params.clone();
    params.extend(derived);
    Ok(params)
}

fn record_count(doc: &Value) -> Option<u64> {
    match doc {
        Value::Array(items) => Some(items.len() as u64),
        Value::Object(_) => Some(1),
        _ => None,
    }
}
