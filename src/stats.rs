//! Store statistics and health overview.
//!
//! Provides a quick summary of what's indexed: row counts, per-source-type
//! breakdowns, the latest build, and the last status snapshot. Used by
//! `evi stats` to give confidence that indexing runs are landing.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::indexer::latest_build_manifest;
use crate::report::RunStatus;
use crate::store::VectorStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    crate::migrate::run_migrations(&pool).await?;
    let store = VectorStore::new(pool);

    let total_rows = store.count().await?;
    let by_source_type = store.counts_by_source_type().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("evidence-index — Store Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Rows:        {}", total_rows);

    if !by_source_type.is_empty() {
        println!();
        println!("  By source type:");
        for (source_type, n) in &by_source_type {
            println!("    {:<16} {:>8}", source_type, n);
        }
    }

    match latest_build_manifest(config) {
        Some(path) => {
            println!();
            println!("  Latest build: {}", path.display());
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(build_id) = manifest.get("build_id").and_then(|v| v.as_str()) {
                        println!("    build_id:   {}", build_id);
                    }
                    if let Some(created) = manifest.get("created_at").and_then(|v| v.as_str()) {
                        println!("    created_at: {}", created);
                    }
                    if let Some(failed) = manifest.get("failed").and_then(|v| v.as_i64()) {
                        if failed > 0 {
                            println!("    failed:     {}", failed);
                        }
                    }
                }
            }
        }
        None => {
            println!();
            println!("  Latest build: none");
        }
    }

    let status_path = config.paths.status_file();
    if let Ok(content) = std::fs::read_to_string(&status_path) {
        if let Ok(status) = serde_json::from_str::<RunStatus>(&content) {
            println!();
            println!("  Last run status ({}):", status.updated_at);
            println!(
                "    processed:  {} / {} (batch {}/{})",
                status.processed,
                status.total,
                status.batch + 1,
                status.batches
            );
            println!(
                "    reused {} / embedded {} / failed {}",
                status.reused, status.embedded, status.failed
            );
        }
    }

    println!();

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
