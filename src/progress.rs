//! Ingestion progress reporting.
//!
//! The ingestion pipeline reports one [`IngestProgress`] per completed batch
//! through a [`ProgressSink`]. Any `Fn(&IngestProgress)` closure is a sink,
//! which keeps tests and embedding callers simple. The CLI picks a reporter
//! with [`ProgressMode`]; output goes to **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// Progress after one batch: `processed` of `total` documents are done.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngestProgress {
    pub processed: usize,
    pub total: usize,
    pub message: String,
}

pub trait ProgressSink: Send + Sync {
    /// Called after each ingestion batch.
    fn report(&self, progress: &IngestProgress);

    /// Called while CRM records are paged in. Totals are unknown here.
    fn fetched(&self, _object_type: &str, _count: usize) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&IngestProgress) + Send + Sync,
{
    fn report(&self, progress: &IngestProgress) {
        self(progress)
    }
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, progress: &IngestProgress) {
        let line = format!("ingest  {}\n", progress.message);
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }

    fn fetched(&self, object_type: &str, count: usize) {
        let line = format!("fetch {}  {} records\n", object_type, format_number(count));
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn emit(obj: serde_json::Value) {
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

impl ProgressSink for JsonProgress {
    fn report(&self, progress: &IngestProgress) {
        Self::emit(serde_json::json!({
            "event": "progress",
            "phase": "embedding",
            "processed": progress.processed,
            "total": progress.total,
            "message": progress.message,
        }));
    }

    fn fetched(&self, object_type: &str, count: usize) {
        Self::emit(serde_json::json!({
            "event": "progress",
            "phase": "fetching",
            "object_type": object_type,
            "fetched": count,
        }));
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: &IngestProgress) {}
}

/// Format with thousands separators: `1234567` → `"1,234,567"`.
pub fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
