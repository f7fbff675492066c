//! Adaptive concurrent embedding executor.
//!
//! Drives one batch of must-embed content through the provider on a bounded
//! worker pool. The pool size is fixed for the duration of a batch; the
//! [`ConcurrencyTuner`] adjusts it between batches from observed stress
//! signals. The controlling loop waits on task completions and a heartbeat
//! tick, whichever comes first, so stall and degradation checks run even
//! while calls are in flight.
//!
//! Failure handling per item: up to `max_attempts` tries with exponential
//! backoff and jitter, then one extra single-threaded rescue attempt after
//! the concurrent pass drains. Items that still fail are reported back as
//! failed, not fatal. Three conditions abort the whole batch (and run):
//! no completion for longer than the stall timeout, windowed throughput
//! stuck below a fraction of the established baseline for longer than the
//! stall timeout, and every item in the batch failing.
//!
//! All timing uses [`tokio::time::Instant`] so the clock can be paused in
//! tests.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::{EmbeddingConfig, IndexingConfig};
use crate::embedding::{EmbeddingProvider, TaskType};
use crate::errors::FatalRunError;

/// Timing and retry knobs for one run, derived from config.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub stall_timeout: Duration,
    pub heartbeat: Duration,
    pub throughput_window: Duration,
    pub degraded_fraction: f64,
    pub baseline_min_items: u64,
}

impl ExecutorSettings {
    pub fn from_config(embedding: &EmbeddingConfig, indexing: &IndexingConfig) -> Self {
        Self {
            max_attempts: embedding.max_attempts,
            backoff_base: Duration::from_secs(embedding.backoff_secs),
            stall_timeout: indexing.stall_timeout(),
            heartbeat: indexing.heartbeat(),
            throughput_window: indexing.throughput_window(),
            degraded_fraction: indexing.degraded_fraction,
            baseline_min_items: indexing.baseline_min_items,
        }
    }
}

/// One distinct piece of content to embed.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub hash: String,
    pub text: String,
}

/// Outcome for one job, index-aligned with the input slice.
#[derive(Debug, Clone)]
pub enum JobResult {
    Embedded { vector: Vec<f32>, attempts: u32 },
    Failed { attempts: u32, last_error: String },
}

impl JobResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, JobResult::Failed { .. })
    }
}

/// Result of running one batch through the pool.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<JobResult>,
    pub throttled: bool,
    pub elapsed: Duration,
}

enum ItemOutcome {
    Ok {
        vector: Vec<f32>,
        attempts: u32,
        throttled: bool,
    },
    Failed {
        attempts: u32,
        last_error: String,
        throttled: bool,
    },
}

/// Exponential backoff with jitter for retry `attempt` (1-based).
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_secs_f64(base.as_secs_f64() * exp * jitter)
}

async fn embed_with_retries(
    provider: &dyn EmbeddingProvider,
    text: &str,
    max_attempts: u32,
    backoff_base: Duration,
) -> ItemOutcome {
    let mut throttled = false;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match provider.embed(text, TaskType::Document).await {
            Ok(vector) => {
                return ItemOutcome::Ok {
                    vector,
                    attempts: attempt,
                    throttled,
                }
            }
            Err(e) => {
                if e.is_throttled() {
                    throttled = true;
                }
                last_error = e.to_string();
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_delay(backoff_base, attempt)).await;
                }
            }
        }
    }

    ItemOutcome::Failed {
        attempts: max_attempts,
        last_error,
        throttled,
    }
}

/// Run one batch of jobs on a pool of `pool_size` workers.
///
/// `tracker` carries run-level throughput state across batches and is only
/// touched from this controlling loop, never from worker tasks. The
/// `on_heartbeat` callback fires on every heartbeat tick with the number of
/// jobs completed so far in this batch and the current windowed rate.
pub async fn run_batch(
    provider: Arc<dyn EmbeddingProvider>,
    jobs: &[BatchJob],
    batch_index: usize,
    pool_size: usize,
    settings: &ExecutorSettings,
    tracker: &mut ThroughputTracker,
    on_heartbeat: &mut dyn FnMut(usize, f64),
) -> Result<BatchOutcome, FatalRunError> {
    let started = Instant::now();
    let mut results: Vec<Option<JobResult>> = vec![None; jobs.len()];
    let mut throttled_seen = false;
    let mut last_error_seen = String::from("none");

    if jobs.is_empty() {
        return Ok(BatchOutcome {
            results: Vec::new(),
            throttled: false,
            elapsed: started.elapsed(),
        });
    }

    let semaphore = Arc::new(Semaphore::new(pool_size));
    let mut join_set: JoinSet<(usize, ItemOutcome)> = JoinSet::new();

    for (i, job) in jobs.iter().enumerate() {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let text = job.text.clone();
        let max_attempts = settings.max_attempts;
        let backoff_base = settings.backoff_base;

        join_set.spawn(async move {
            // Closing the semaphore is never done here; acquire only fails
            // if it were, so treat that as a permanent failure.
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    return (
                        i,
                        ItemOutcome::Failed {
                            attempts: 0,
                            last_error: "worker pool closed".to_string(),
                            throttled: false,
                        },
                    )
                }
            };
            let outcome =
                embed_with_retries(provider.as_ref(), &text, max_attempts, backoff_base).await;
            (i, outcome)
        });
    }

    let mut last_progress = Instant::now();
    let mut finished = 0usize;
    let mut ticker = tokio::time::interval(settings.heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick completes immediately

    while finished < jobs.len() {
        tokio::select! {
            joined = join_set.join_next() => {
                let Some(joined) = joined else { break };
                finished += 1;
                match joined {
                    Ok((i, ItemOutcome::Ok { vector, attempts, throttled })) => {
                        throttled_seen |= throttled;
                        last_progress = Instant::now();
                        tracker.record_completion();
                        results[i] = Some(JobResult::Embedded { vector, attempts });
                    }
                    Ok((i, ItemOutcome::Failed { attempts, last_error, throttled })) => {
                        throttled_seen |= throttled;
                        last_error_seen = last_error.clone();
                        results[i] = Some(JobResult::Failed { attempts, last_error });
                    }
                    Err(join_err) => {
                        // A panicked worker counts as a failed item; the
                        // slot is recovered in the rescue pass below.
                        last_error_seen = format!("worker task failed: {}", join_err);
                    }
                }
            }
            _ = ticker.tick() => {
                if last_progress.elapsed() > settings.stall_timeout {
                    join_set.abort_all();
                    return Err(FatalRunError::Stalled {
                        batch: batch_index,
                        stalled_secs: last_progress.elapsed().as_secs(),
                        in_flight: jobs.len() - finished,
                        last_error: last_error_seen,
                    });
                }
                tracker.sample();
                if let Some(degraded) = tracker.check_degraded() {
                    join_set.abort_all();
                    return Err(FatalRunError::Degraded {
                        batch: batch_index,
                        baseline_rate: degraded.baseline_rate,
                        current_rate: degraded.current_rate,
                        degraded_secs: degraded.for_secs,
                    });
                }
                on_heartbeat(finished, tracker.windowed_rate());
            }
        }
    }

    // Slots left empty by panicked workers become explicit failures.
    for slot in results.iter_mut() {
        if slot.is_none() {
            *slot = Some(JobResult::Failed {
                attempts: 0,
                last_error: last_error_seen.clone(),
            });
        }
    }
    let mut results: Vec<JobResult> = results.into_iter().map(|r| r.unwrap()).collect();

    // An entire batch failing indicates a systemic outage, not bad inputs;
    // burning the rescue pass on it would only delay the abort.
    if results.iter().all(|r| r.is_failed()) {
        return Err(FatalRunError::BatchFailed {
            batch: batch_index,
            item_count: jobs.len(),
            last_error: last_error_seen,
        });
    }

    // Rescue pass: one single-threaded attempt for items that failed the
    // concurrent pass, to absorb failures caused only by pool contention.
    for (i, result) in results.iter_mut().enumerate() {
        if let JobResult::Failed { attempts, .. } = result {
            let prior_attempts = *attempts;
            match provider.embed(&jobs[i].text, TaskType::Document).await {
                Ok(vector) => {
                    tracker.record_completion();
                    *result = JobResult::Embedded {
                        vector,
                        attempts: prior_attempts + 1,
                    };
                }
                Err(e) => {
                    throttled_seen |= e.is_throttled();
                    *result = JobResult::Failed {
                        attempts: prior_attempts + 1,
                        last_error: e.to_string(),
                    };
                }
            }
        }
    }

    Ok(BatchOutcome {
        results,
        throttled: throttled_seen,
        elapsed: started.elapsed(),
    })
}

// ============ Throughput tracking ============

/// Degradation verdict returned by [`ThroughputTracker::check_degraded`].
#[derive(Debug, Clone, Copy)]
pub struct Degraded {
    pub baseline_rate: f64,
    pub current_rate: f64,
    pub for_secs: u64,
}

/// Run-level sliding window of completion samples.
///
/// Owned by the run controller; updated only from the controlling loop.
/// Once `baseline_min_items` items have completed, the overall rate at that
/// moment becomes the baseline. Afterwards the windowed rate is compared
/// against `degraded_fraction * baseline`; staying under it continuously
/// for longer than the stall timeout is a fatal degradation.
pub struct ThroughputTracker {
    window: Duration,
    degraded_fraction: f64,
    grace: Duration,
    baseline_min_items: u64,
    started: Instant,
    completed: u64,
    samples: VecDeque<(Instant, u64)>,
    baseline: Option<f64>,
    degraded_since: Option<Instant>,
}

impl ThroughputTracker {
    pub fn new(settings: &ExecutorSettings) -> Self {
        let now = Instant::now();
        let mut samples = VecDeque::new();
        samples.push_back((now, 0));
        Self {
            window: settings.throughput_window,
            degraded_fraction: settings.degraded_fraction,
            grace: settings.stall_timeout,
            baseline_min_items: settings.baseline_min_items,
            started: now,
            completed: 0,
            samples,
            baseline: None,
            degraded_since: None,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Record one successful item completion.
    pub fn record_completion(&mut self) {
        self.completed += 1;
        self.push_sample();

        if self.baseline.is_none() && self.completed >= self.baseline_min_items {
            let elapsed = self.started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.baseline = Some(self.completed as f64 / elapsed);
            }
        }
    }

    /// Age the window without a completion (called on heartbeat ticks).
    pub fn sample(&mut self) {
        self.push_sample();
    }

    fn push_sample(&mut self) {
        let now = Instant::now();
        self.samples.push_back((now, self.completed));
        let cutoff = now.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            // Keep one sample older than the window so the span covers it.
            while self.samples.len() > 2 && self.samples[1].0 <= cutoff {
                self.samples.pop_front();
            }
        }
    }

    /// Items per second over the recent window.
    pub fn windowed_rate(&self) -> f64 {
        let Some(&(oldest_at, oldest_count)) = self.samples.front() else {
            return 0.0;
        };
        let span = oldest_at.elapsed().as_secs_f64();
        if span <= f64::EPSILON {
            return f64::INFINITY;
        }
        (self.completed - oldest_count) as f64 / span
    }

    /// Overall items per second since the run started.
    pub fn overall_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.completed as f64 / elapsed
    }

    /// Check for sustained degradation. Returns `Some` once the windowed
    /// rate has stayed below the floor continuously for the grace period.
    pub fn check_degraded(&mut self) -> Option<Degraded> {
        let baseline = self.baseline?;
        let current = self.windowed_rate();

        if current >= baseline * self.degraded_fraction {
            self.degraded_since = None;
            return None;
        }

        let since = *self.degraded_since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.grace {
            return Some(Degraded {
                baseline_rate: baseline,
                current_rate: current,
                for_secs: since.elapsed().as_secs(),
            });
        }
        None
    }
}

// ============ Concurrency tuning ============

/// Stress signals observed for one batch that made provider calls.
#[derive(Debug, Clone, Copy)]
pub struct BatchStats {
    pub items: usize,
    pub failed: usize,
    pub throttled: bool,
    pub elapsed: Duration,
}

/// Between-batch pool sizing with hysteresis.
///
/// Any stress signal in a batch steps the pool down once and resets the
/// clean streak; the pool steps up only after enough consecutive clean
/// batches. Batch times are compared per item so a short final batch does
/// not read as a speedup.
pub struct ConcurrencyTuner {
    min: usize,
    max: usize,
    step: usize,
    clean_needed: u32,
    failure_rate_threshold: f64,
    slowdown_factor: f64,
    pool: usize,
    clean_streak: u32,
    prev_per_item: Option<Duration>,
}

impl ConcurrencyTuner {
    pub fn new(indexing: &IndexingConfig) -> Self {
        Self {
            min: indexing.min_concurrency,
            max: indexing.max_concurrency,
            step: indexing.concurrency_step,
            clean_needed: indexing.clean_batches_before_increase,
            failure_rate_threshold: indexing.failure_rate_threshold,
            slowdown_factor: indexing.batch_slowdown_factor,
            pool: indexing.initial_concurrency,
            clean_streak: 0,
            prev_per_item: None,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool
    }

    /// Feed one batch's signals in; returns `(from, to, reason)` when the
    /// pool size changed.
    pub fn observe_batch(&mut self, stats: BatchStats) -> Option<(usize, usize, String)> {
        if stats.items == 0 {
            return None;
        }

        let per_item = stats.elapsed / stats.items as u32;
        let failure_rate = stats.failed as f64 / stats.items as f64;

        let mut stress: Vec<&str> = Vec::new();
        if stats.throttled {
            stress.push("throttled");
        }
        if failure_rate > self.failure_rate_threshold {
            stress.push("failure rate");
        }
        if let Some(prev) = self.prev_per_item {
            if per_item.as_secs_f64() > prev.as_secs_f64() * self.slowdown_factor {
                stress.push("batch slowdown");
            }
        }
        self.prev_per_item = Some(per_item);

        if !stress.is_empty() {
            self.clean_streak = 0;
            let from = self.pool;
            self.pool = self.pool.saturating_sub(self.step).max(self.min);
            if self.pool != from {
                return Some((from, self.pool, stress.join(", ")));
            }
            return None;
        }

        self.clean_streak += 1;
        if self.clean_streak >= self.clean_needed && self.pool < self.max {
            let from = self.pool;
            self.pool = (self.pool + self.step).min(self.max);
            self.clean_streak = 0;
            return Some((
                from,
                self.pool,
                format!("{} clean batches", self.clean_needed),
            ));
        }
        None
    }
}
