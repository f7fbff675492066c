//! End-to-end pipeline tests with a scripted embedding provider.
//!
//! These exercise the incremental guarantees: unchanged content never hits
//! the provider again, duplicate content costs one call, per-item failures
//! stay contained, systemic failures abort, and stale rows are evicted.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use evidence_index::config::Config;
use evidence_index::db;
use evidence_index::embedding::{EmbeddingProvider, TaskType};
use evidence_index::errors::EmbedError;
use evidence_index::executor::{run_batch, BatchJob, ExecutorSettings, ThroughputTracker};
use evidence_index::indexer::add_chunks;
use evidence_index::migrate;
use evidence_index::models::ChunkRecord;
use evidence_index::report::NoProgress;
use evidence_index::store::VectorStore;

const DIMS: usize = 4;

/// Deterministic fake embedding derived from the text.
fn vector_for(text: &str) -> Vec<f32> {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest[..DIMS]
        .iter()
        .map(|&b| b as f32 / 255.0)
        .collect()
}

type EmbedFn = Box<dyn Fn(&str, usize) -> Result<Vec<f32>, EmbedError> + Send + Sync>;

/// Provider driven by a closure, counting every call.
struct MockProvider {
    calls: AtomicUsize,
    f: EmbedFn,
}

impl MockProvider {
    fn new(f: EmbedFn) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            f,
        })
    }

    fn ok() -> Arc<Self> {
        Self::new(Box::new(|text, _| Ok(vector_for(text))))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, text: &str, _task: TaskType) -> Result<Vec<f32>, EmbedError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(text, n)
    }
}

/// Provider whose calls never complete; used for stall detection.
struct HangingProvider;

#[async_trait]
impl EmbeddingProvider for HangingProvider {
    fn model_name(&self) -> &str {
        "hanging"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, _text: &str, _task: TaskType) -> Result<Vec<f32>, EmbedError> {
        std::future::pending().await
    }
}

fn record(chunk_id: &str, text: &str) -> ChunkRecord {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    ChunkRecord {
        chunk_id: chunk_id.to_string(),
        doc_uid: "doc1".to_string(),
        parent_id: "doc1:p001".to_string(),
        text: text.to_string(),
        hash: format!("{:x}", hasher.finalize()),
        page_index: Some(1),
        char_start: None,
        char_end: None,
        citable: true,
        source_type: "evidence".to_string(),
    }
}

/// Config rooted in a temp dir; single-attempt retries so failing items
/// never sleep on backoff.
fn test_config(root: &Path, checkpoint_size: usize) -> Config {
    let toml_src = format!(
        r#"
[db]
path = "{root}/index/test.sqlite"

[paths]
meta = "{root}/meta"
chunks = "{root}/chunks"

[embedding]
max_attempts = 1
backoff_secs = 1

[indexing]
checkpoint_size = {checkpoint_size}
initial_concurrency = 4
stall_timeout_secs = 60
heartbeat_secs = 1
"#,
        root = root.display(),
        checkpoint_size = checkpoint_size,
    );
    toml::from_str(&toml_src).unwrap()
}

async fn open_store(config: &Config) -> VectorStore {
    let pool = db::connect(&config.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    VectorStore::new(pool)
}

#[tokio::test]
async fn test_second_run_makes_zero_provider_calls() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    let store = open_store(&config).await;

    let chunks: Vec<ChunkRecord> = (0..25)
        .map(|i| record(&format!("c{:03}", i), &format!("chunk text {}", i)))
        .collect();

    let provider = MockProvider::ok();
    let report = add_chunks(&config, &store, provider.clone(), &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(report.embedded, 25);
    assert_eq!(provider.calls(), 25);
    let first_state = store.read_existing().await.unwrap();

    let provider2 = MockProvider::ok();
    let report2 = add_chunks(&config, &store, provider2.clone(), &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(provider2.calls(), 0, "unchanged input must not re-embed");
    assert_eq!(report2.reused, 25);
    assert_eq!(report2.embedded, 0);

    let second_state = store.read_existing().await.unwrap();
    assert_eq!(first_state, second_state);
    assert_eq!(store.count().await.unwrap(), 25);
}

#[tokio::test]
async fn test_changing_one_chunk_recomputes_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    let store = open_store(&config).await;

    let mut chunks: Vec<ChunkRecord> = (0..8)
        .map(|i| record(&format!("c{:03}", i), &format!("chunk text {}", i)))
        .collect();

    let provider = MockProvider::ok();
    add_chunks(&config, &store, provider, &chunks, &NoProgress, true)
        .await
        .unwrap();
    let before = store.read_existing().await.unwrap();

    chunks[3] = record("c003", "chunk text 3 REVISED");

    let provider2 = MockProvider::ok();
    let report = add_chunks(&config, &store, provider2.clone(), &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(provider2.calls(), 1);
    assert_eq!(report.reused, 7);
    assert_eq!(report.embedded, 1);

    let after = store.read_existing().await.unwrap();
    assert_eq!(after.len(), 8);
    for (hash, vector) in &before {
        if hash == &chunks[3].hash {
            continue;
        }
        if let Some(kept) = after.get(hash) {
            assert_eq!(kept, vector, "unchanged vector must be carried forward");
        }
    }
    assert_eq!(
        after.get(&chunks[3].hash).unwrap(),
        &vector_for("chunk text 3 REVISED")
    );
}

#[tokio::test]
async fn test_duplicate_hash_costs_one_call() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    let store = open_store(&config).await;

    // Identical text (hence hash) under two chunk ids.
    let chunks = vec![
        record("c001", "shared content"),
        record("c002", "shared content"),
        record("c003", "unique content"),
    ];

    let provider = MockProvider::ok();
    let report = add_chunks(&config, &store, provider.clone(), &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(provider.calls(), 2);
    assert_eq!(report.embedded, 3);
    assert_eq!(store.count().await.unwrap(), 3);

    // Both rows carry the same vector for the shared content.
    let hits = store.search(&vector_for("shared content"), 10, true).await.unwrap();
    assert!((hits[0].score - hits[1].score).abs() < 1e-6);
}

#[tokio::test]
async fn test_duplicate_hash_across_batches_costs_one_call() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2);
    let store = open_store(&config).await;

    // c003 lands in the second batch but repeats c001's content.
    let chunks = vec![
        record("c001", "repeated content"),
        record("c002", "other content"),
        record("c003", "repeated content"),
    ];

    let provider = MockProvider::ok();
    let report = add_chunks(&config, &store, provider.clone(), &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(provider.calls(), 2);
    assert_eq!(report.reused, 1);
    assert_eq!(report.embedded, 2);
}

#[tokio::test]
async fn test_partial_failure_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 50);
    let store = open_store(&config).await;

    let chunks: Vec<ChunkRecord> = (0..50)
        .map(|i| record(&format!("c{:03}", i), &format!("chunk text {}", i)))
        .collect();

    // One chunk fails permanently (concurrent pass and rescue pass).
    let provider = MockProvider::new(Box::new(|text, _| {
        if text == "chunk text 17" {
            Err(EmbedError::Failed("invalid content".to_string()))
        } else {
            Ok(vector_for(text))
        }
    }));

    let report = add_chunks(&config, &store, provider, &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(report.embedded, 49);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].chunk_id, "c017");
    assert_eq!(store.count().await.unwrap(), 49);

    // The ledger holds exactly the failed chunk.
    let ledger = std::fs::read_to_string(config.paths.failure_ledger()).unwrap();
    let lines: Vec<&str> = ledger.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("c017"));
}

#[tokio::test]
async fn test_all_failed_batch_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    let store = open_store(&config).await;

    let chunks: Vec<ChunkRecord> = (0..10)
        .map(|i| record(&format!("c{:03}", i), &format!("chunk text {}", i)))
        .collect();

    let provider = MockProvider::new(Box::new(|_, _| {
        Err(EmbedError::Failed("connection refused".to_string()))
    }));

    let err = add_chunks(&config, &store, provider, &chunks, &NoProgress, true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("every item"));
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test]
async fn test_stale_rows_are_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    let store = open_store(&config).await;

    let chunks = vec![
        record("c001", "kept content"),
        record("c002", "doomed content"),
    ];
    add_chunks(&config, &store, MockProvider::ok(), &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(store.count().await.unwrap(), 2);

    let shrunk = vec![record("c001", "kept content")];
    let provider = MockProvider::ok();
    let report = add_chunks(&config, &store, provider.clone(), &shrunk, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(provider.calls(), 0);
    assert_eq!(report.reused, 1);
    assert_eq!(store.count().await.unwrap(), 1);

    let remaining = store.read_existing().await.unwrap();
    assert!(remaining.contains_key(&shrunk[0].hash));
    assert!(!remaining.contains_key(&chunks[1].hash));
}

#[tokio::test]
async fn test_rescue_pass_recovers_contention_failures() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    let store = open_store(&config).await;

    let chunks = vec![
        record("c001", "steady content"),
        record("c002", "flaky content"),
    ];

    // The flaky chunk fails its concurrent attempt but succeeds on the
    // single-threaded rescue pass.
    let attempts: Mutex<HashMap<String, usize>> = Mutex::new(HashMap::new());
    let provider = MockProvider::new(Box::new(move |text, _| {
        let mut attempts = attempts.lock().unwrap();
        let n = attempts.entry(text.to_string()).or_insert(0);
        *n += 1;
        if text == "flaky content" && *n == 1 {
            Err(EmbedError::Failed("deadline exceeded".to_string()))
        } else {
            Ok(vector_for(text))
        }
    }));

    let report = add_chunks(&config, &store, provider, &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(report.embedded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_corrupt_prior_state_degrades_to_full_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);

    // A database without the expected schema: reading prior state fails,
    // the run recomputes everything and rebuilds the table.
    let pool = db::connect(&config.db.path).await.unwrap();
    let store = VectorStore::new(pool);

    let chunks = vec![record("c001", "content one"), record("c002", "content two")];
    let provider = MockProvider::ok();

    migrate::run_migrations(store.pool()).await.unwrap();
    sqlx::query("DROP TABLE vector_rows")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("CREATE TABLE vector_rows (chunk_id TEXT PRIMARY KEY)")
        .execute(store.pool())
        .await
        .unwrap();

    let err = add_chunks(&config, &store, provider.clone(), &chunks, &NoProgress, true).await;
    // The degraded read succeeds, but the write hits the crippled schema:
    // that is fatal (write errors risk data loss).
    assert!(err.is_err());

    // With the real schema restored, the same input indexes cleanly.
    sqlx::query("DROP TABLE vector_rows")
        .execute(store.pool())
        .await
        .unwrap();
    migrate::run_migrations(store.pool()).await.unwrap();
    let report = add_chunks(&config, &store, provider, &chunks, &NoProgress, true)
        .await
        .unwrap();
    assert_eq!(report.embedded, 2);
}

// ============ Executor-level timing tests (paused clock) ============

fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        max_attempts: 3,
        backoff_base: std::time::Duration::from_secs(1),
        stall_timeout: std::time::Duration::from_secs(10),
        heartbeat: std::time::Duration::from_secs(1),
        throughput_window: std::time::Duration::from_secs(5),
        degraded_fraction: 0.25,
        baseline_min_items: 20,
    }
}

fn jobs(n: usize) -> Vec<BatchJob> {
    (0..n)
        .map(|i| BatchJob {
            hash: format!("h{}", i),
            text: format!("text {}", i),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_stall_aborts_batch() {
    let settings = fast_settings();
    let mut tracker = ThroughputTracker::new(&settings);
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(HangingProvider);

    let err = run_batch(
        provider,
        &jobs(4),
        0,
        2,
        &settings,
        &mut tracker,
        &mut |_, _| {},
    )
    .await
    .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("stalled"), "got: {}", message);
    assert!(message.contains("4 in flight"), "got: {}", message);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_item_retries_then_succeeds() {
    let settings = fast_settings();
    let mut tracker = ThroughputTracker::new(&settings);

    // Every text: throttled twice, then embedded on the third attempt.
    let attempts: Mutex<HashMap<String, usize>> = Mutex::new(HashMap::new());
    let provider = MockProvider::new(Box::new(move |text, _| {
        let mut attempts = attempts.lock().unwrap();
        let n = attempts.entry(text.to_string()).or_insert(0);
        *n += 1;
        if *n <= 2 {
            Err(EmbedError::Throttled("429 too many requests".to_string()))
        } else {
            Ok(vector_for(text))
        }
    }));

    let outcome = run_batch(
        provider,
        &jobs(3),
        0,
        2,
        &settings,
        &mut tracker,
        &mut |_, _| {},
    )
    .await
    .unwrap();

    assert!(outcome.throttled);
    assert!(outcome.results.iter().all(|r| !r.is_failed()));
    assert_eq!(tracker.completed(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_fires_during_slow_batch() {
    let settings = fast_settings();
    let mut tracker = ThroughputTracker::new(&settings);

    // Each call takes 3 heartbeats' worth of time.
    let provider = MockProvider::new(Box::new(|text, _| Ok(vector_for(text))));
    struct SlowProvider(Arc<MockProvider>);
    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            DIMS
        }
        async fn embed(&self, text: &str, task: TaskType) -> Result<Vec<f32>, EmbedError> {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            self.0.embed(text, task).await
        }
    }

    let mut heartbeats = 0usize;
    let outcome = run_batch(
        Arc::new(SlowProvider(provider)),
        &jobs(2),
        0,
        1,
        &settings,
        &mut tracker,
        &mut |_, _| heartbeats += 1,
    )
    .await
    .unwrap();

    assert!(outcome.results.iter().all(|r| !r.is_failed()));
    assert!(heartbeats >= 2, "expected heartbeats while in flight");
}
