//! Chunk source: loads the chunk records produced by the segmentation step.
//!
//! The upstream chunker writes one JSON object per line to
//! `chunks/chunks.jsonl`. This module is the only place that file format is
//! known; the rest of the pipeline works with [`ChunkRecord`] values.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;

use crate::models::ChunkRecord;

/// Read the ordered chunk list from a JSONL file.
///
/// Blank lines are skipped. Enforces the chunk-source contract: every record
/// has a non-empty `chunk_id` and `hash`, and `chunk_id` is unique within
/// the file. A malformed line is an error (the file is tool-generated, so a
/// bad line means the upstream step is broken, not the data).
pub fn list_chunks(path: &Path) -> Result<Vec<ChunkRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chunk records: {}", path.display()))?;

    let mut records = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ChunkRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid chunk record", path.display(), lineno + 1))?;

        if record.chunk_id.is_empty() {
            bail!("{}:{}: chunk record missing chunk_id", path.display(), lineno + 1);
        }
        if record.hash.is_empty() {
            bail!(
                "{}:{}: chunk '{}' missing content hash",
                path.display(),
                lineno + 1,
                record.chunk_id
            );
        }
        if !seen_ids.insert(record.chunk_id.clone()) {
            bail!(
                "{}:{}: duplicate chunk_id '{}'",
                path.display(),
                lineno + 1,
                record.chunk_id
            );
        }

        records.push(record);
    }

    Ok(records)
}
