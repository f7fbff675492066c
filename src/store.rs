//! SQLite-backed vector store.
//!
//! Persists [`VectorRow`]s keyed by `chunk_id`, with the content `hash`
//! indexed for incremental reuse. Embeddings are stored as little-endian
//! `f32` BLOBs. Writes are idempotent upserts, so the pipeline's
//! at-least-once delivery contract holds: re-writing a row is harmless.
//!
//! The run-level overwrite semantics (the store ends up holding exactly the
//! current input set) come from [`VectorStore::create_or_overwrite`], which
//! clears the table before writing the first batch of a run; later batches
//! use [`VectorStore::append`].

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::models::{SearchHit, VectorRow};

pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Read the prior state as a `hash -> vector` map.
    ///
    /// Callers degrade to "recompute everything" when this fails; a corrupt
    /// or pre-schema store must not fail the run.
    pub async fn read_existing(&self) -> Result<HashMap<String, Vec<f32>>> {
        let rows = sqlx::query("SELECT hash, embedding FROM vector_rows")
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let hash: String = row.get("hash");
            let blob: Vec<u8> = row.get("embedding");
            map.insert(hash, blob_to_vec(&blob));
        }
        Ok(map)
    }

    /// Write the first batch of a run, dropping all prior rows.
    ///
    /// Stale rows (chunks absent from the current input) are evicted here;
    /// rows for the current input are re-written batch by batch.
    pub async fn create_or_overwrite(&self, rows: &[VectorRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vector_rows")
            .execute(&mut *tx)
            .await?;
        insert_rows(&mut tx, rows).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append a later batch of the same run.
    pub async fn append(&self, rows: &[VectorRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_rows(&mut tx, rows).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Cosine-rank stored rows against a query vector.
    ///
    /// Similarity is computed in Rust over all candidate rows; `limit` caps
    /// the returned hits after ranking.
    pub async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        citable_only: bool,
    ) -> Result<Vec<SearchHit>> {
        let sql = if citable_only {
            "SELECT chunk_id, doc_uid, parent_id, text, page_index, char_start, char_end,
                    citable, source_type, embedding
             FROM vector_rows WHERE citable = 1"
        } else {
            "SELECT chunk_id, doc_uid, parent_id, text, page_index, char_start, char_end,
                    citable, source_type, embedding
             FROM vector_rows"
        };

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let text: String = row.get("text");
                let snippet: String = text.chars().take(240).collect();
                let citable: i64 = row.get("citable");

                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    doc_uid: row.get("doc_uid"),
                    parent_id: row.get("parent_id"),
                    score: cosine_similarity(query_vector, &vector) as f64,
                    snippet,
                    page_index: row.get("page_index"),
                    char_start: row.get("char_start"),
                    char_end: row.get("char_end"),
                    citable: citable != 0,
                    source_type: row.get("source_type"),
                }
            })
            .collect();

        // Sort: score desc, chunk_id asc (deterministic)
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_rows")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Per-source-type row counts, largest first.
    pub async fn counts_by_source_type(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT source_type, COUNT(*) AS n FROM vector_rows
             GROUP BY source_type ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("source_type"), row.get("n")))
            .collect())
    }
}

async fn insert_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    rows: &[VectorRow],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    for row in rows {
        let blob = vec_to_blob(&row.vector);
        let r = &row.record;
        sqlx::query(
            r#"
            INSERT INTO vector_rows
                (chunk_id, doc_uid, parent_id, text, hash, page_index,
                 char_start, char_end, citable, source_type, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                doc_uid = excluded.doc_uid,
                parent_id = excluded.parent_id,
                text = excluded.text,
                hash = excluded.hash,
                page_index = excluded.page_index,
                char_start = excluded.char_start,
                char_end = excluded.char_end,
                citable = excluded.citable,
                source_type = excluded.source_type,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&r.chunk_id)
        .bind(&r.doc_uid)
        .bind(&r.parent_id)
        .bind(&r.text)
        .bind(&r.hash)
        .bind(r.page_index)
        .bind(r.char_start)
        .bind(r.char_end)
        .bind(r.citable as i64)
        .bind(&r.source_type)
        .bind(&blob)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
