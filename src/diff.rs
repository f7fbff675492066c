//! Hash diff engine.
//!
//! Partitions a batch of chunk records into rows whose vector can be copied
//! forward (content hash already known) and distinct pieces of content that
//! must go to the embedding provider. Reuse is content-addressed: every
//! chunk whose hash matches a known vector reuses it, regardless of
//! `chunk_id`, and duplicate hashes inside one batch collapse into a single
//! provider call.

use std::collections::HashMap;

use crate::models::ChunkRecord;

/// One distinct piece of content to embed, with every batch position that
/// shares its hash.
#[derive(Debug, Clone)]
pub struct RecomputeItem {
    pub hash: String,
    /// Positions in the batch slice; the text is taken from the first.
    pub indices: Vec<usize>,
}

/// Result of diffing one batch against known vectors.
#[derive(Debug, Clone, Default)]
pub struct EmbedPlan {
    /// `(batch index, vector)` pairs whose embedding is copied forward.
    pub reuse: Vec<(usize, Vec<f32>)>,
    /// Distinct content that needs provider calls.
    pub recompute: Vec<RecomputeItem>,
}

impl EmbedPlan {
    /// Number of rows that will be filled without provider calls.
    pub fn reused_rows(&self) -> usize {
        self.reuse.len()
    }

    /// Number of provider calls this plan requires.
    pub fn calls_needed(&self) -> usize {
        self.recompute.len()
    }
}

/// Partition `batch` against prior store state and the hashes already
/// written earlier in this run.
///
/// `written_this_run` is consulted as well as `prior` so that a hash
/// embedded in an earlier batch is never re-embedded when it recurs later
/// in the same run.
pub fn partition_chunks(
    batch: &[ChunkRecord],
    prior: &HashMap<String, Vec<f32>>,
    written_this_run: &HashMap<String, Vec<f32>>,
) -> EmbedPlan {
    let mut plan = EmbedPlan::default();
    let mut pending: HashMap<&str, usize> = HashMap::new();

    for (i, record) in batch.iter().enumerate() {
        let hash = record.hash.as_str();

        if let Some(vector) = written_this_run.get(hash).or_else(|| prior.get(hash)) {
            plan.reuse.push((i, vector.clone()));
            continue;
        }

        match pending.get(hash) {
            Some(&slot) => plan.recompute[slot].indices.push(i),
            None => {
                pending.insert(hash, plan.recompute.len());
                plan.recompute.push(RecomputeItem {
                    hash: hash.to_string(),
                    indices: vec![i],
                });
            }
        }
    }

    plan
}
