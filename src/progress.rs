//! Ingest progress reporting.
//!
//! Every pipeline of an ingest run reports what it is discovering and how
//! many of its sources are done. Progress goes to **stderr** so stdout stays
//! parseable for scripts.

use std::io::Write;

use crate::models::IngestSummary;

/// A single progress event from one pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Walking the pipeline's root; total unknown.
    Discovering { pipeline: String },
    /// `n` of `total` sources have been through the state machine.
    Ingesting {
        pipeline: String,
        n: u64,
        total: u64,
    },
    /// The pipeline finished.
    Done {
        pipeline: String,
        succeeded: u64,
        unchanged: u64,
        skipped: u64,
        failed: u64,
    },
}

impl ProgressEvent {
    pub fn done(pipeline: &str, summary: &IngestSummary) -> Self {
        ProgressEvent::Done {
            pipeline: pipeline.to_string(),
            succeeded: summary.succeeded,
            unchanged: summary.unchanged,
            skipped: summary.skipped.len() as u64,
            failed: summary.failed.len() as u64,
        }
    }
}

/// Receives progress from concurrently running pipelines.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly lines: `ingest code/api  ingesting  12 / 40 sources`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { pipeline } => {
                format!("ingest {}  discovering...\n", pipeline)
            }
            ProgressEvent::Ingesting { pipeline, n, total } => format!(
                "ingest {}  ingesting  {} / {} sources\n",
                pipeline,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Done {
                pipeline,
                succeeded,
                unchanged,
                skipped,
                failed,
            } => format!(
                "ingest {}  done  {} indexed, {} unchanged, {} skipped, {} failed\n",
                pipeline,
                format_number(*succeeded),
                format_number(*unchanged),
                format_number(*skipped),
                format_number(*failed)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { pipeline } => serde_json::json!({
                "event": "progress",
                "pipeline": pipeline,
                "phase": "discovering"
            }),
            ProgressEvent::Ingesting { pipeline, n, total } => serde_json::json!({
                "event": "progress",
                "pipeline": pipeline,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            ProgressEvent::Done {
                pipeline,
                succeeded,
                unchanged,
                skipped,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "pipeline": pipeline,
                "phase": "done",
                "succeeded": succeeded,
                "unchanged": unchanged,
                "skipped": skipped,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `--progress` setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}'. Must be human, json, or off.",
                other
            )),
        }
    }
}
