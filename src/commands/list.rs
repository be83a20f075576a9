// ABOUTME: List command - shows configured links without connecting anywhere
// ABOUTME: Prints a table or JSON summary of each link's source and destination

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{LinkConfig, SyncConfig};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct LinkSummary {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub mode: &'static str,
}

impl LinkSummary {
    pub fn from_link(link: &LinkConfig) -> Self {
        let source = match (&link.source.table, &link.source.query) {
            (Some(table), _) => format!("{}.{}", link.source.connection, table),
            (None, Some(query)) => format!("{}: {}", link.source.connection, query.trim()),
            (None, None) => link.source.connection.clone(),
        };

        let mode = if link.source.query.is_some() {
            "rebuild"
        } else if link.destination.sequence_field.is_some() {
            "incremental"
        } else {
            "diff"
        };

        Self {
            name: link.name.clone(),
            source,
            destination: format!("{}.{}", link.destination.connection, link.destination.table),
            mode,
        }
    }
}

pub fn summarize(config: &SyncConfig) -> Vec<LinkSummary> {
    config.links.iter().map(LinkSummary::from_link).collect()
}

pub async fn list(config_path: &Path, json: bool) -> Result<()> {
    let config = SyncConfig::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let summaries = summarize(&config);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summaries).context("Failed to serialize links")?
        );
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No links configured.");
        return Ok(());
    }

    for summary in &summaries {
        println!(
            "{:<24} {:<12} {} -> {}",
            summary.name, summary.mode, summary.source, summary.destination
        );
    }
    Ok(())
}
