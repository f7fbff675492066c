use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_meta_dir")]
    pub meta: PathBuf,
    #[serde(default = "default_chunks_dir")]
    pub chunks: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            meta: default_meta_dir(),
            chunks: default_chunks_dir(),
        }
    }
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("meta")
}
fn default_chunks_dir() -> PathBuf {
    PathBuf::from("chunks")
}

impl PathsConfig {
    /// Path of the chunk records file produced by the segmentation step.
    pub fn chunks_file(&self) -> PathBuf {
        self.chunks.join("chunks.jsonl")
    }

    /// Path of the live status snapshot (overwritten in place).
    pub fn status_file(&self) -> PathBuf {
        self.meta.join("index_status.json")
    }

    /// Path of the durable per-item failure ledger.
    pub fn failure_ledger(&self) -> PathBuf {
        self.meta.join("embed_failures.jsonl")
    }

    /// Path of the append-only artifact version log.
    pub fn version_log(&self) -> PathBuf {
        self.meta.join("version_log.jsonl")
    }

    /// Directory holding one subdirectory per build manifest.
    pub fn builds_dir(&self) -> PathBuf {
        self.meta.join("builds")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_task_type_document")]
    pub task_type_document: String,
    #[serde(default = "default_task_type_query")]
    pub task_type_query: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            task_type_document: default_task_type_document(),
            task_type_query: default_task_type_query(),
            timeout_secs: 30,
            max_attempts: 3,
            backoff_secs: 2,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_task_type_document() -> String {
    "RETRIEVAL_DOCUMENT".to_string()
}
fn default_task_type_query() -> String {
    "RETRIEVAL_QUERY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    2
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Knobs for the checkpointed batch loop and the adaptive executor.
///
/// Concurrency is adjusted only between batches, inside
/// `[min_concurrency, max_concurrency]`: one step down after any stressed
/// batch (throttling, failure rate over `failure_rate_threshold`, or batch
/// wall-clock growing past `batch_slowdown_factor` times the previous
/// batch), one step up only after `clean_batches_before_increase`
/// consecutive clean batches.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_checkpoint_size")]
    pub checkpoint_size: usize,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_initial_concurrency")]
    pub initial_concurrency: usize,
    #[serde(default = "default_concurrency_step")]
    pub concurrency_step: usize,
    #[serde(default = "default_clean_batches")]
    pub clean_batches_before_increase: u32,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_batch_slowdown_factor")]
    pub batch_slowdown_factor: f64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
    #[serde(default = "default_degraded_fraction")]
    pub degraded_fraction: f64,
    #[serde(default = "default_baseline_min_items")]
    pub baseline_min_items: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            checkpoint_size: default_checkpoint_size(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            initial_concurrency: default_initial_concurrency(),
            concurrency_step: default_concurrency_step(),
            clean_batches_before_increase: default_clean_batches(),
            failure_rate_threshold: default_failure_rate_threshold(),
            batch_slowdown_factor: default_batch_slowdown_factor(),
            stall_timeout_secs: default_stall_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            throughput_window_secs: default_throughput_window_secs(),
            degraded_fraction: default_degraded_fraction(),
            baseline_min_items: default_baseline_min_items(),
        }
    }
}

fn default_checkpoint_size() -> usize {
    100
}
fn default_min_concurrency() -> usize {
    1
}
fn default_max_concurrency() -> usize {
    8
}
fn default_initial_concurrency() -> usize {
    4
}
fn default_concurrency_step() -> usize {
    1
}
fn default_clean_batches() -> u32 {
    3
}
fn default_failure_rate_threshold() -> f64 {
    0.1
}
fn default_batch_slowdown_factor() -> f64 {
    1.5
}
fn default_stall_timeout_secs() -> u64 {
    120
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_throughput_window_secs() -> u64 {
    30
}
fn default_degraded_fraction() -> f64 {
    0.25
}
fn default_baseline_min_items() -> u64 {
    20
}

impl IndexingConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_final_limit() -> usize {
    10
}
fn default_candidate_k() -> usize {
    50
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let idx = &config.indexing;

    if idx.checkpoint_size == 0 {
        anyhow::bail!("indexing.checkpoint_size must be > 0");
    }
    if idx.min_concurrency == 0 {
        anyhow::bail!("indexing.min_concurrency must be >= 1");
    }
    if idx.min_concurrency > idx.max_concurrency {
        anyhow::bail!("indexing.min_concurrency must be <= indexing.max_concurrency");
    }
    if idx.initial_concurrency < idx.min_concurrency || idx.initial_concurrency > idx.max_concurrency
    {
        anyhow::bail!(
            "indexing.initial_concurrency must be within [min_concurrency, max_concurrency]"
        );
    }
    if !(0.0..=1.0).contains(&idx.failure_rate_threshold) {
        anyhow::bail!("indexing.failure_rate_threshold must be in [0.0, 1.0]");
    }
    if idx.batch_slowdown_factor < 1.0 {
        anyhow::bail!("indexing.batch_slowdown_factor must be >= 1.0");
    }
    if !(0.0..1.0).contains(&idx.degraded_fraction) || idx.degraded_fraction == 0.0 {
        anyhow::bail!("indexing.degraded_fraction must be in (0.0, 1.0)");
    }
    if idx.stall_timeout_secs == 0 {
        anyhow::bail!("indexing.stall_timeout_secs must be > 0");
    }

    if config.retrieval.final_limit == 0 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_attempts == 0 {
            anyhow::bail!("embedding.max_attempts must be >= 1");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "vertex" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or vertex.",
            other
        ),
    }

    Ok(())
}

/// Hash of the canonical JSON serialization of the config.
///
/// Embedded in build ids so a manifest records the configuration it was
/// produced under.
pub fn config_hash(config: &Config) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Default TOML written by `evi init` when no config file exists yet.
pub fn default_config_toml() -> String {
    r#"[db]
path = "index/evidence.sqlite"

[paths]
meta = "meta"
chunks = "chunks"

[embedding]
provider = "disabled"
# provider = "vertex"
# model = "gemini-embedding-001"
# dims = 1536
timeout_secs = 30
max_attempts = 3
backoff_secs = 2

[indexing]
checkpoint_size = 100
min_concurrency = 1
max_concurrency = 8
initial_concurrency = 4
stall_timeout_secs = 120
heartbeat_secs = 5

[retrieval]
final_limit = 10
candidate_k = 50
"#
    .to_string()
}
