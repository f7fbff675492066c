//! Core data models used throughout evidence-index.
//!
//! These types represent the chunk records, vector rows, and run artifacts
//! that flow through the incremental indexing pipeline.

use serde::{Deserialize, Serialize};

/// One unit of source text with stable identity and content hash.
///
/// Produced by the upstream segmentation step and read from
/// `chunks/chunks.jsonl`. The pipeline treats records as immutable for the
/// duration of one run; `hash` must be a deterministic function of `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub doc_uid: String,
    pub parent_id: String,
    pub text: String,
    pub hash: String,
    #[serde(default)]
    pub page_index: Option<i64>,
    #[serde(default)]
    pub char_start: Option<i64>,
    #[serde(default)]
    pub char_end: Option<i64>,
    #[serde(default = "default_citable")]
    pub citable: bool,
    #[serde(default = "default_source_type")]
    pub source_type: String,
}

fn default_citable() -> bool {
    true
}

fn default_source_type() -> String {
    "evidence".to_string()
}

/// A chunk record together with its embedding vector.
///
/// Created by the executor for freshly-embedded chunks, or copied forward
/// from the existing store when the content hash matched.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub record: ChunkRecord,
    pub vector: Vec<f32>,
}

/// One entry per chunk that could not be embedded after all retries.
///
/// Appended to the failure ledger at end of run; never fatal on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub chunk_id: String,
    pub text_preview: String,
    pub attempts: u32,
    pub last_error: String,
}

impl FailureRecord {
    /// Build a failure record, truncating the text to a short preview.
    pub fn new(chunk_id: &str, text: &str, attempts: u32, last_error: &str) -> Self {
        let text_preview: String = text.chars().take(120).collect();
        Self {
            chunk_id: chunk_id.to_string(),
            text_preview,
            attempts,
            last_error: last_error.to_string(),
        }
    }
}

/// Final accounting for one `add_chunks` run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub total: usize,
    pub reused: usize,
    pub embedded: usize,
    pub failed: usize,
    pub batches: usize,
    pub failures: Vec<FailureRecord>,
}

impl RunReport {
    /// Rows actually written to the store (reused + freshly embedded).
    pub fn written(&self) -> usize {
        self.reused + self.embedded
    }
}

/// A ranked row returned from vector search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_uid: String,
    pub parent_id: String,
    pub score: f64,
    pub snippet: String,
    pub page_index: Option<i64>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
    pub citable: bool,
    pub source_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_record_optional_fields_default() {
        let json = r#"{
            "chunk_id": "doc1:c001",
            "doc_uid": "doc1",
            "parent_id": "doc1:p001",
            "text": "hello",
            "hash": "abc"
        }"#;
        let rec: ChunkRecord = serde_json::from_str(json).unwrap();
        assert!(rec.citable);
        assert_eq!(rec.source_type, "evidence");
        assert!(rec.page_index.is_none());
    }

    #[test]
    fn test_failure_record_preview_truncates() {
        let long = "x".repeat(500);
        let rec = FailureRecord::new("c1", &long, 3, "boom");
        assert_eq!(rec.text_preview.chars().count(), 120);
        assert_eq!(rec.attempts, 3);
    }
}
