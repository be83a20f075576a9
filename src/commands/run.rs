// ABOUTME: Run command - executes one copier operation across configured links
// ABOUTME: Prints per-link reports and fails when any link failed

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::SyncConfig;
use crate::registry::{BatchStats, LinkRegistry, Operation};

pub async fn run(config_path: &Path, operation: Operation, links: &[String], json: bool) -> Result<()> {
    let config = SyncConfig::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let registry = LinkRegistry::from_config(&config).context("Failed to build links")?;

    let stats = registry
        .run(links, operation)
        .await
        .with_context(|| format!("Failed to run {}", operation))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("Failed to serialize results")?
        );
    } else {
        print_stats(&stats);
    }

    if !stats.is_success() {
        bail!(
            "{} of {} link(s) failed",
            stats.errors.len(),
            stats.errors.len() + stats.links_synced
        );
    }
    Ok(())
}

fn print_stats(stats: &BatchStats) {
    for report in &stats.reports {
        println!(
            "{}: {} ({} rows moved, {} deleted/flagged, {} indexes)",
            report.table,
            report.strategy,
            report.rows_moved,
            report.rows_deleted_or_flagged,
            report.indexes_created
        );
        for (view, created) in &report.views {
            let status = if *created { "recreated" } else { "FAILED" };
            println!("  view {}: {}", view, status);
        }
    }
    for error in &stats.errors {
        println!("✗ {}", error);
    }
    println!(
        "{} link(s) synced in {}ms",
        stats.links_synced, stats.duration_ms
    );
}
