//! Run progress reporting.
//!
//! Reports each pipeline stage transition so users see what a run is doing.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::{IsTerminal, Write};

use crate::pipeline::Stage;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// The run entered `stage`. `records` is known from mapping onwards.
    Stage {
        integration: String,
        stage: Stage,
        records: Option<u64>,
    },
    /// The run ended, successfully or not.
    Finished {
        integration: String,
        ok: bool,
        duration_ms: i64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunReporter: Send + Sync {
    /// Emit a progress event. Called from the pipeline.
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run prices  persisting  1,234 records".
pub struct StderrProgress;

impl RunReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Stage {
                integration,
                stage,
                records: Some(n),
            } => format!(
                "run {}  {}  {} records\n",
                integration,
                stage.as_str(),
                format_number(*n)
            ),
            RunProgressEvent::Stage {
                integration,
                stage,
                records: None,
            } => format!("run {}  {}...\n", integration, stage.as_str()),
            RunProgressEvent::Finished {
                integration,
                ok,
                duration_ms,
            } => format!(
                "run {}  {}  in {} ms\n",
                integration,
                if *ok { "done" } else { "failed" },
                format_number((*duration_ms).max(0) as u64)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Stage {
                integration,
                stage,
                records,
            } => serde_json::json!({
                "event": "progress",
                "integration": integration,
                "stage": stage.as_str(),
                "records": records
            }),
            RunProgressEvent::Finished {
                integration,
                ok,
                duration_ms,
            } => serde_json::json!({
                "event": "finished",
                "integration": integration,
                "ok": ok,
                "duration_ms": duration_ms
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn RunReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
