use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider, TaskType};
use crate::models::SearchHit;
use crate::store::VectorStore;

/// The `evi search` command: embed the query and cosine-rank stored rows.
///
/// Only citable rows are returned unless `include_non_citable` is set;
/// evidence output must never silently mix in non-citable sources.
pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    include_non_citable: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let provider: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let query_vector = provider
        .embed(query, TaskType::Query)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to embed query: {}", e))?;

    let pool = db::connect(&config.db.path).await?;
    crate::migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);

    let final_limit = limit.unwrap_or(config.retrieval.final_limit);
    let candidate_k = config.retrieval.candidate_k.max(final_limit);
    let hits = store
        .search(&query_vector, candidate_k, !include_non_citable)
        .await?;

    let hits: Vec<&SearchHit> = hits.iter().take(final_limit).collect();

    if hits.is_empty() {
        println!("No results.");
        store.pool().close().await;
        return Ok(());
    }

    if include_non_citable {
        println!("Applied filters: none");
    } else {
        println!("Applied filters: citable=true");
    }
    print_source_summary(&hits);
    println!();

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.3}] {} / {}", i + 1, hit.score, hit.doc_uid, hit.chunk_id);
        println!("    parent: {}", hit.parent_id);
        println!("    locator: {}", locator_display(hit));
        if !hit.citable {
            println!("    citable: false");
        }
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!();
    }

    store.pool().close().await;
    Ok(())
}

/// One-line count of returned rows grouped by source type.
fn print_source_summary(hits: &[&SearchHit]) {
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for hit in hits {
        *by_type.entry(hit.source_type.as_str()).or_insert(0) += 1;
    }
    let parts: Vec<String> = by_type
        .iter()
        .map(|(source_type, n)| format!("{}:{}", source_type, n))
        .collect();
    println!(
        "Returned sources summary: total={}; {}",
        hits.len(),
        parts.join(", ")
    );
}

/// Prefer a page locator; fall back to a character span, then "weak".
fn locator_display(hit: &SearchHit) -> String {
    if let Some(page) = hit.page_index {
        return format!("page {}", page);
    }
    if let (Some(start), Some(end)) = (hit.char_start, hit.char_end) {
        return format!("chars {}-{}", start, end);
    }
    "weak".to_string()
}
