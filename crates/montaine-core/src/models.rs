//! Records shared between the pipeline and its stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Interactive or CLI `run`, static parameters.
    Manual,
    /// Scheduler-driven `auto`, parameters derived from the aggregation pipeline.
    Auto,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Manual => "manual",
            RunMode::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<RunMode> {
        match s {
            "manual" => Some(RunMode::Manual),
            "auto" => Some(RunMode::Auto),
            _ => None,
        }
    }
}

/// One pipeline execution, recorded whether it succeeded or not.
///
/// Entries are written once at the end of a run and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub id: String,
    pub integration: String,
    pub acting_user: Option<String>,
    pub mode: RunMode,
    pub status: bool,
    /// Stage that failed, for unsuccessful runs.
    pub stage: Option<String>,
    /// Result summary on success, `{code, description}` on failure.
    pub payload: Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}
