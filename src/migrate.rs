use anyhow::Result;
use sqlx::SqlitePool;

/// Create the vector store schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per chunk in the current input set. The embedding is stored
    // as little-endian f32 bytes; `hash` is the content digest used for
    // incremental reuse.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_rows (
            chunk_id TEXT PRIMARY KEY,
            doc_uid TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            page_index INTEGER,
            char_start INTEGER,
            char_end INTEGER,
            citable INTEGER NOT NULL DEFAULT 1,
            source_type TEXT NOT NULL DEFAULT 'evidence',
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vector_rows_hash ON vector_rows(hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vector_rows_doc_uid ON vector_rows(doc_uid)")
        .execute(pool)
        .await?;

    Ok(())
}
