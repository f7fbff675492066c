//! Incremental indexing run controller.
//!
//! Coordinates the full flow for one run: diff each checkpoint-sized batch
//! against known vectors, drive the must-embed set through the adaptive
//! executor, merge reused and fresh rows, and persist batch by batch — the
//! first batch overwrites the store (evicting stale rows), later batches
//! append. Concurrency is re-tuned between batches; per-item failures are
//! collected into the ledger and never stop the run.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{config_hash, Config};
use crate::db;
use crate::diff::partition_chunks;
use crate::embedding::{self, EmbeddingProvider};
use crate::errors::FatalRunError;
use crate::executor::{
    run_batch, BatchJob, BatchStats, ConcurrencyTuner, ExecutorSettings, JobResult,
    ThroughputTracker,
};
use crate::models::{ChunkRecord, FailureRecord, RunReport, VectorRow};
use crate::report::{
    append_failure_ledger, append_version_log, IndexProgressEvent, IndexProgressReporter,
    RunStatus, StatusSink,
};
use crate::sources;
use crate::store::VectorStore;

/// Run the incremental pipeline over `chunks`.
///
/// When `reuse_prior` is false the prior store state is ignored and every
/// chunk recomputes (the `--full` path). Returns the run accounting; the
/// failure ledger has already been written when the report carries
/// failures. Fatal conditions (stall, degradation, all-failed batch, store
/// write errors) propagate as errors.
pub async fn add_chunks(
    config: &Config,
    store: &VectorStore,
    provider: Arc<dyn EmbeddingProvider>,
    chunks: &[ChunkRecord],
    reporter: &dyn IndexProgressReporter,
    reuse_prior: bool,
) -> Result<RunReport> {
    let total = chunks.len();
    if total == 0 {
        return Ok(RunReport {
            total: 0,
            reused: 0,
            embedded: 0,
            failed: 0,
            batches: 0,
            failures: Vec::new(),
        });
    }

    let prior: HashMap<String, Vec<f32>> = if reuse_prior {
        match store.read_existing().await {
            Ok(map) => map,
            Err(e) => {
                // A corrupt or pre-schema store must not fail the run.
                eprintln!("Warning: could not read prior store state, recomputing all: {}", e);
                HashMap::new()
            }
        }
    } else {
        HashMap::new()
    };

    let settings = ExecutorSettings::from_config(&config.embedding, &config.indexing);
    let mut tracker = ThroughputTracker::new(&settings);
    let mut tuner = ConcurrencyTuner::new(&config.indexing);
    let status_sink = StatusSink::new(config.paths.status_file());

    let checkpoint_size = config.indexing.checkpoint_size;
    let batches: Vec<&[ChunkRecord]> = chunks.chunks(checkpoint_size).collect();
    let batch_count = batches.len();

    // Hashes embedded earlier in this run; consulted by the diff so
    // duplicate content across batches costs one provider call.
    let mut written: HashMap<String, Vec<f32>> = HashMap::new();

    let mut reused = 0usize;
    let mut embedded = 0usize;
    let mut failed = 0usize;
    let mut processed = 0usize;
    let mut failures: Vec<FailureRecord> = Vec::new();

    for (batch_index, batch) in batches.iter().enumerate() {
        let plan = partition_chunks(batch, &prior, &written);
        let pool_size = tuner.pool_size();

        reporter.report(IndexProgressEvent::BatchStarted {
            batch: batch_index,
            batches: batch_count,
            items: batch.len(),
            pool_size,
        });

        let jobs: Vec<BatchJob> = plan
            .recompute
            .iter()
            .map(|item| BatchJob {
                hash: item.hash.clone(),
                text: batch[item.indices[0]].text.clone(),
            })
            .collect();

        let processed_before = processed;
        let counters_before = (reused, embedded, failed);
        let mut on_heartbeat = |done_in_batch: usize, rate: f64| {
            let now_processed = processed_before + done_in_batch;
            let remaining = total.saturating_sub(now_processed);
            let eta_secs = if rate > f64::EPSILON && rate.is_finite() {
                Some((remaining as f64 / rate).round() as u64)
            } else {
                None
            };
            status_sink.write(&RunStatus {
                processed: now_processed,
                total,
                batch: batch_index,
                batches: batch_count,
                pool_size,
                reused: counters_before.0,
                embedded: counters_before.1,
                failed: counters_before.2,
                items_per_sec: if rate.is_finite() { rate } else { 0.0 },
                eta_secs,
                updated_at: now_ts(),
            });
            reporter.report(IndexProgressEvent::Heartbeat {
                processed: now_processed,
                total,
                items_per_sec: if rate.is_finite() { rate } else { 0.0 },
            });
        };

        let outcome = run_batch(
            provider.clone(),
            &jobs,
            batch_index,
            pool_size,
            &settings,
            &mut tracker,
            &mut on_heartbeat,
        )
        .await?;

        // Merge: reused vectors first, then fresh results fanned out to
        // every batch position sharing the content hash.
        let mut rows: Vec<VectorRow> = Vec::with_capacity(batch.len());
        for (i, vector) in &plan.reuse {
            rows.push(VectorRow {
                record: batch[*i].clone(),
                vector: vector.clone(),
            });
        }
        reused += plan.reuse.len();

        let mut batch_failed_jobs = 0usize;
        for (job_index, result) in outcome.results.iter().enumerate() {
            let item = &plan.recompute[job_index];
            match result {
                JobResult::Embedded { vector, .. } => {
                    for &i in &item.indices {
                        rows.push(VectorRow {
                            record: batch[i].clone(),
                            vector: vector.clone(),
                        });
                    }
                    embedded += item.indices.len();
                    written.insert(item.hash.clone(), vector.clone());
                }
                JobResult::Failed {
                    attempts,
                    last_error,
                } => {
                    batch_failed_jobs += 1;
                    for &i in &item.indices {
                        let record = &batch[i];
                        failures.push(FailureRecord::new(
                            &record.chunk_id,
                            &record.text,
                            *attempts,
                            last_error,
                        ));
                    }
                    failed += item.indices.len();
                }
            }
        }

        let write_result = if batch_index == 0 {
            store.create_or_overwrite(&rows).await
        } else {
            store.append(&rows).await
        };
        write_result.map_err(|e| FatalRunError::StoreWrite {
            batch: batch_index,
            message: format!("{:#}", e),
        })?;

        processed += batch.len();

        reporter.report(IndexProgressEvent::BatchCommitted {
            batch: batch_index,
            reused: plan.reuse.len(),
            embedded: rows.len() - plan.reuse.len(),
            failed: batch.len() - rows.len(),
        });

        if !jobs.is_empty() {
            let change = tuner.observe_batch(BatchStats {
                items: jobs.len(),
                failed: batch_failed_jobs,
                throttled: outcome.throttled,
                elapsed: outcome.elapsed,
            });
            if let Some((from, to, reason)) = change {
                reporter.report(IndexProgressEvent::PoolResized { from, to, reason });
            }
        }

        status_sink.write(&RunStatus {
            processed,
            total,
            batch: batch_index,
            batches: batch_count,
            pool_size: tuner.pool_size(),
            reused,
            embedded,
            failed,
            items_per_sec: tracker.overall_rate(),
            eta_secs: None,
            updated_at: now_ts(),
        });
    }

    if !failures.is_empty() {
        let ledger = config.paths.failure_ledger();
        append_failure_ledger(&ledger, &failures)
            .with_context(|| format!("Failed to write failure ledger: {}", ledger.display()))?;
        append_version_log(
            &config.paths.version_log(),
            &ledger,
            "append",
            "embed_failures",
        );
    }

    Ok(RunReport {
        total,
        reused,
        embedded,
        failed,
        batches: batch_count,
        failures,
    })
}

/// Diff the whole input without embedding anything (`--dry-run`).
///
/// Returns `(reusable rows, provider calls needed)` with within-run
/// duplicate content counted the way a real run would.
pub fn plan_counts(
    chunks: &[ChunkRecord],
    prior: &HashMap<String, Vec<f32>>,
    checkpoint_size: usize,
) -> (usize, usize) {
    let mut written: HashMap<String, Vec<f32>> = HashMap::new();
    let mut reused = 0usize;
    let mut calls = 0usize;

    for batch in chunks.chunks(checkpoint_size) {
        let plan = partition_chunks(batch, prior, &written);
        reused += plan.reused_rows();
        calls += plan.calls_needed();
        for item in &plan.recompute {
            written.insert(item.hash.clone(), Vec::new());
        }
    }
    (reused, calls)
}

/// The `evi index` command: load chunk records, run the pipeline, print a
/// summary, and record a build manifest.
pub async fn run_index(
    config: &Config,
    reporter: &dyn IndexProgressReporter,
    full: bool,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    let chunks_file = config.paths.chunks_file();
    let mut chunks = sources::list_chunks(&chunks_file)?;
    if let Some(lim) = limit {
        chunks.truncate(lim);
    }

    let pool = db::connect(&config.db.path).await?;
    crate::migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);

    let prior = if full {
        HashMap::new()
    } else {
        store.read_existing().await.unwrap_or_default()
    };

    if dry_run {
        let (reusable, calls) = plan_counts(&chunks, &prior, config.indexing.checkpoint_size);
        println!("index (dry-run)");
        println!("  chunks: {}", chunks.len());
        println!("  reusable: {}", reusable);
        println!("  embedding calls needed: {}", calls);
        store.pool().close().await;
        return Ok(());
    }

    if chunks.is_empty() {
        println!("index");
        println!("  no chunk records in {}", chunks_file.display());
        store.pool().close().await;
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        // A run that needs zero provider calls can still complete.
        let (_, calls) = plan_counts(&chunks, &prior, config.indexing.checkpoint_size);
        if calls > 0 {
            anyhow::bail!(
                "Embedding provider is disabled and {} chunks need embedding. Set [embedding] provider in config.",
                calls
            );
        }
    }

    let provider: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);

    let report = add_chunks(config, &store, provider, &chunks, reporter, !full).await?;

    write_build_manifest(config, &report)?;

    println!("index");
    println!("  chunks: {}", report.total);
    println!("  reused: {}", report.reused);
    println!("  embedded: {}", report.embedded);
    println!("  batches: {}", report.batches);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
        eprintln!(
            "Warning: {} chunks failed to embed; see {}",
            report.failed,
            config.paths.failure_ledger().display()
        );
    }
    println!("ok");

    store.pool().close().await;
    Ok(())
}

/// Record a build manifest under `meta/builds/<build_id>/`.
fn write_build_manifest(config: &Config, report: &RunReport) -> Result<()> {
    let cfg_hash = config_hash(config);
    let version = env!("CARGO_PKG_VERSION");
    let build_id = format!(
        "build-{}-{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        &cfg_hash[..6],
        version
    );

    let manifest = serde_json::json!({
        "build_id": build_id,
        "created_at": now_ts(),
        "config_hash": cfg_hash,
        "tool_version": version,
        "chunk_count": report.total,
        "reused": report.reused,
        "embedded": report.embedded,
        "failed": report.failed,
        "provider": config.embedding.provider,
    });

    let build_dir = config.paths.builds_dir().join(&build_id);
    std::fs::create_dir_all(&build_dir)
        .with_context(|| format!("Failed to create {}", build_dir.display()))?;
    let manifest_path = build_dir.join("build_manifest.json");
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

    append_version_log(
        &config.paths.version_log(),
        &manifest_path,
        "create",
        "build_manifest",
    );
    Ok(())
}

/// Most recent build manifest path, if any build has completed.
pub fn latest_build_manifest(config: &Config) -> Option<std::path::PathBuf> {
    let builds_dir = config.paths.builds_dir();
    let mut manifests: Vec<std::path::PathBuf> = std::fs::read_dir(&builds_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path().join("build_manifest.json"))
        .filter(|p| p.exists())
        .collect();
    manifests.sort();
    manifests.pop()
}

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
