//! Engine statistics.
//!
//! A summary of what is indexed and where blobs live, used by `bdx stats`.

use bitdex_core::index::IndexStats;
use bitdex_core::store::cache::CacheStats;
use serde::Serialize;

use crate::content_store::BackendInfo;
use crate::engine::Engine;

#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub version: u64,
    pub paths: usize,
    pub layers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub database: String,
    pub database_bytes: u64,
    pub index: IndexStats,
    pub tree: TreeStats,
    pub backends: Vec<BackendInfo>,
    pub cache: Option<CacheStats>,
}

/// Collect statistics from an open engine.
pub fn collect(engine: &Engine) -> EngineStats {
    let db_path = &engine.config().db.path;
    let database_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    EngineStats {
        database: db_path.display().to_string(),
        database_bytes,
        index: engine.index().stats(),
        tree: TreeStats {
            version: engine.tree_version(),
            // The root is not counted.
            paths: engine.context_paths().len().saturating_sub(1),
            layers: engine.list_layers().len(),
        },
        backends: engine.store().list_backends(),
        cache: engine.store().cache_stats(),
    }
}

/// Print a human-readable summary.
pub fn print_stats(stats: &EngineStats) {
    println!("Bitdex Stats");
    println!("============");
    println!();
    println!("  Database:    {}", stats.database);
    println!("  Size:        {}", format_bytes(stats.database_bytes));
    println!();
    println!("  Documents:   {}", stats.index.documents);
    println!("  Next id:     {}", stats.index.next_id);
    println!("  Checksums:   {}", stats.index.checksums);
    println!(
        "  Labels:      {} context / {} feature / {} filter",
        stats.index.context_labels, stats.index.feature_labels, stats.index.filter_labels
    );
    println!(
        "  Tree:        {} paths, {} layers (version {})",
        stats.tree.paths, stats.tree.layers, stats.tree.version
    );

    if let Some(cache) = &stats.cache {
        let lookups = cache.hits + cache.misses;
        println!(
            "  Cache:       {} entries, {} ({}% hit rate)",
            cache.entries,
            format_bytes(cache.bytes),
            if lookups > 0 {
                (cache.hits * 100) / lookups
            } else {
                0
            }
        );
    }

    if !stats.backends.is_empty() {
        println!();
        println!("  Backends:");
        println!("  {:<20} {:<8} {}", "NAME", "KIND", "STATUS");
        println!("  {}", "-".repeat(48));
        for b in &stats.backends {
            let status = match &b.status {
                crate::content_store::BackendStatus::Online => "online".to_string(),
                crate::content_store::BackendStatus::Offline => "offline".to_string(),
                crate::content_store::BackendStatus::Error(msg) => format!("error: {}", msg),
            };
            println!("  {:<20} {:<8} {}", b.name, b.kind, status);
        }
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
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
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
