//! Error taxonomy for the indexing pipeline.
//!
//! Two layers, kept deliberately separate:
//! - [`EmbedError`] — one provider call failed; retryable when throttled,
//!   otherwise permanent for that call. Exhausting retries produces a
//!   per-item failure record, not an abort.
//! - [`FatalRunError`] — the whole run is stuck or systemically failing and
//!   must abort with a diagnostic (stall, sustained degradation, an entire
//!   batch failing, or a store write error).

use thiserror::Error;

/// Failure of a single embedding call.
#[derive(Debug, Clone, Error)]
pub enum EmbedError {
    /// Rate-limit or overload signal; the executor retries with backoff and
    /// feeds the signal into concurrency tuning.
    #[error("embedding throttled: {0}")]
    Throttled(String),

    /// Any other error; treated as permanent for this call.
    #[error("embedding failed: {0}")]
    Failed(String),
}

impl EmbedError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, EmbedError::Throttled(_))
    }
}

/// A condition that aborts the entire run.
#[derive(Debug, Error)]
pub enum FatalRunError {
    /// No item completed for longer than the stall timeout.
    #[error(
        "indexing stalled: no item completed in {stalled_secs}s (batch {batch}, {in_flight} in flight); last error: {last_error}"
    )]
    Stalled {
        batch: usize,
        stalled_secs: u64,
        in_flight: usize,
        last_error: String,
    },

    /// Windowed throughput stayed below the degradation floor for longer
    /// than the stall timeout after a baseline was established.
    #[error(
        "indexing throughput degraded: {current_rate:.2} items/s vs baseline {baseline_rate:.2} items/s for over {degraded_secs}s (batch {batch})"
    )]
    Degraded {
        batch: usize,
        baseline_rate: f64,
        current_rate: f64,
        degraded_secs: u64,
    },

    /// Every item in a batch failed; treated as a systemic outage.
    #[error("every item in batch {batch} failed ({item_count} items); last error: {last_error}")]
    BatchFailed {
        batch: usize,
        item_count: usize,
        last_error: String,
    },

    /// The store rejected a batch write. Fatal: continuing risks silent
    /// data loss for later batches.
    #[error("vector store write failed in batch {batch}: {message}")]
    StoreWrite { batch: usize, message: String },
}
