//! Run reporting: live progress, the status snapshot, and the failure ledger.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! The status snapshot is a JSON file overwritten in place (latest wins) for
//! external monitors to tail; writing it is best-effort and never fails the
//! run. The failure ledger is the one durable artifact here: a JSONL file
//! operators inspect to remediate chunks that exhausted their retries.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::FailureRecord;

/// A single progress event from the indexing run.
#[derive(Clone, Debug)]
pub enum IndexProgressEvent {
    /// A batch is starting with the given worker pool size.
    BatchStarted {
        batch: usize,
        batches: usize,
        items: usize,
        pool_size: usize,
    },
    /// Periodic heartbeat while a batch is in flight.
    Heartbeat {
        processed: usize,
        total: usize,
        items_per_sec: f64,
    },
    /// The pool size changed between batches.
    PoolResized {
        from: usize,
        to: usize,
        reason: String,
    },
    /// A batch was written to the store.
    BatchCommitted {
        batch: usize,
        reused: usize,
        embedded: usize,
        failed: usize,
    },
}

/// Reports indexing progress. Implementations write to stderr (human or JSON).
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::BatchStarted {
                batch,
                batches,
                items,
                pool_size,
            } => format!(
                "index  batch {}/{}  {} items  pool {}\n",
                batch + 1,
                batches,
                items,
                pool_size
            ),
            IndexProgressEvent::Heartbeat {
                processed,
                total,
                items_per_sec,
            } => format!(
                "index  {} / {} items  {:.1} items/s\n",
                processed, total, items_per_sec
            ),
            IndexProgressEvent::PoolResized { from, to, reason } => {
                format!("index  pool {} -> {}  ({})\n", from, to, reason)
            }
            IndexProgressEvent::BatchCommitted {
                batch,
                reused,
                embedded,
                failed,
            } => format!(
                "index  batch {} committed  reused {}  embedded {}  failed {}\n",
                batch + 1,
                reused,
                embedded,
                failed
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let obj = match &event {
            IndexProgressEvent::BatchStarted {
                batch,
                batches,
                items,
                pool_size,
            } => serde_json::json!({
                "event": "batch_started",
                "batch": batch,
                "batches": batches,
                "items": items,
                "pool_size": pool_size
            }),
            IndexProgressEvent::Heartbeat {
                processed,
                total,
                items_per_sec,
            } => serde_json::json!({
                "event": "heartbeat",
                "processed": processed,
                "total": total,
                "items_per_sec": items_per_sec
            }),
            IndexProgressEvent::PoolResized { from, to, reason } => serde_json::json!({
                "event": "pool_resized",
                "from": from,
                "to": to,
                "reason": reason
            }),
            IndexProgressEvent::BatchCommitted {
                batch,
                reused,
                embedded,
                failed,
            } => serde_json::json!({
                "event": "batch_committed",
                "batch": batch,
                "reused": reused,
                "embedded": embedded,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Latest-wins snapshot of run progress for external monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub processed: usize,
    pub total: usize,
    pub batch: usize,
    pub batches: usize,
    pub pool_size: usize,
    pub reused: usize,
    pub embedded: usize,
    pub failed: usize,
    pub items_per_sec: f64,
    pub eta_secs: Option<u64>,
    pub updated_at: String,
}

/// Writes [`RunStatus`] snapshots to a fixed path, overwriting in place.
///
/// Every write error is swallowed: status is observability, not state.
pub struct StatusSink {
    path: PathBuf,
}

impl StatusSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write(&self, status: &RunStatus) {
        let Ok(json) = serde_json::to_string_pretty(status) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&self.path, json);
    }
}

/// Append failure records to the durable ledger, one JSON object per line.
pub fn append_failure_ledger(path: &Path, failures: &[FailureRecord]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    for failure in failures {
        let line = serde_json::to_string(failure)?;
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

/// Append a record of an artifact write to the version log. Best-effort.
pub fn append_version_log(path: &Path, file_written: &Path, action: &str, note: &str) {
    let record = serde_json::json!({
        "timestamp": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "file": file_written.display().to_string(),
        "action": action,
        "note": note,
    });
    let Ok(line) = serde_json::to_string(&record) else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", line);
    }
}
