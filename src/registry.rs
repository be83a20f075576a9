// ABOUTME: Named sync links built once from configuration
// ABOUTME: Runs an operation across links, collecting per-link reports and errors

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{LinkConfig, SourceConfig, SyncConfig};
use crate::copier::{Copier, SyncReport};
use crate::destination::{Destination, SqlHook};
use crate::error::{Result, SyncError};
use crate::postgres::{ConnectionProvider, PgConnection};
use crate::source::{Source, TableSource};

/// Operations that can be run across links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Update,
    Droppy,
    Diffy,
    FindDeletes,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Update => "update",
            Operation::Droppy => "droppy",
            Operation::Diffy => "diffy",
            Operation::FindDeletes => "find_deletes",
        };
        f.write_str(name)
    }
}

/// Statistics from running one operation across links.
#[derive(Debug, Default, Serialize)]
pub struct BatchStats {
    pub links_synced: usize,
    pub rows_moved: u64,
    pub rows_deleted_or_flagged: u64,
    pub reports: Vec<SyncReport>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl BatchStats {
    /// True when every link completed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A configured source/destination pair.
pub struct Link {
    pub name: String,
    pub copier: Copier,
}

/// All configured links. Links naming the same connection share one
/// [`PgConnection`], which is what lets a copier detect that source and
/// destination live on the same physical connection.
pub struct LinkRegistry {
    connections: BTreeMap<String, Arc<PgConnection>>,
    links: Vec<Link>,
}

impl LinkRegistry {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let mut connections = BTreeMap::new();
        for (name, connection) in &config.connections {
            let url = connection.resolve_url(name)?;
            connections.insert(name.clone(), Arc::new(PgConnection::new(name.clone(), url)));
        }

        let links = config
            .links
            .iter()
            .map(|link| build_link(link, &connections))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { connections, links })
    }

    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Copier> {
        self.links
            .iter()
            .find(|l| l.name == name)
            .map(|l| &l.copier)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn connection(&self, name: &str) -> Option<&Arc<PgConnection>> {
        self.connections.get(name)
    }

    /// Run `operation` on the named links in order, or on every link when
    /// `names` is empty.
    ///
    /// Unknown names fail before anything runs. A failing link is logged and
    /// recorded in [`BatchStats::errors`]; the remaining links still run.
    pub async fn run(&self, names: &[String], operation: Operation) -> Result<BatchStats> {
        let selected: Vec<&Link> = if names.is_empty() {
            self.links.iter().collect()
        } else {
            names
                .iter()
                .map(|name| {
                    self.links
                        .iter()
                        .find(|l| &l.name == name)
                        .ok_or_else(|| SyncError::Config(format!("unknown link '{}'", name)))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let start = std::time::Instant::now();
        let mut stats = BatchStats::default();

        for link in selected {
            tracing::info!("Running {} on link {}", operation, link.name);
            let outcome = match operation {
                Operation::Update => link.copier.update().await,
                Operation::Droppy => link.copier.droppy().await,
                Operation::Diffy => link.copier.diffy().await,
                Operation::FindDeletes => link.copier.find_deletes().await,
            };

            match outcome {
                Ok(report) => {
                    stats.links_synced += 1;
                    stats.rows_moved += report.rows_moved;
                    stats.rows_deleted_or_flagged += report.rows_deleted_or_flagged;
                    for (view, created) in &report.views {
                        if !created {
                            tracing::warn!("View {} on link {} was not recreated", view, link.name);
                        }
                    }
                    stats.reports.push(report);
                }
                Err(e) => {
                    tracing::error!("Failed to {} link {}: {:?}", operation, link.name, e);
                    stats
                        .errors
                        .push(format!("Failed to {} link {}: {}", operation, link.name, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }
}

fn build_link(link: &LinkConfig, connections: &BTreeMap<String, Arc<PgConnection>>) -> Result<Link> {
    let provider = |name: &str| -> Result<Arc<dyn ConnectionProvider>> {
        connections
            .get(name)
            .map(|c| c.clone() as Arc<dyn ConnectionProvider>)
            .ok_or_else(|| {
                SyncError::Config(format!("link '{}': unknown connection '{}'", link.name, name))
            })
    };

    let src = &link.source;
    let source_provider = provider(&src.connection)?;
    let source = match (&src.table, &src.query) {
        (Some(table), None) => {
            let mut table_source = TableSource::new(table.clone(), source_provider);
            if let Some(template) = src.infer_primary_key.clone() {
                table_source = table_source.with_primary_key_inference(Arc::new(move |table: &str| {
                    SourceConfig::inferred_primary_key(&template, table)
                }));
            }
            Source::Table(table_source)
        }
        (None, Some(query)) => Source::query(query.clone(), source_provider),
        _ => {
            return Err(SyncError::Config(format!(
                "link '{}': source must set exactly one of table or query",
                link.name
            )))
        }
    };

    let dst = &link.destination;
    let mut destination =
        Destination::new(dst.table.clone(), provider(&dst.connection)?).with_auto_index(dst.auto_index);
    if let Some(pk) = &dst.primary_key {
        destination = destination.with_primary_key(pk.clone());
    }
    if let Some(sequence_field) = &dst.sequence_field {
        destination = destination.with_sequence_field(sequence_field.clone());
    }
    if let Some(soft_delete_field) = &dst.soft_delete_field {
        destination = destination.with_soft_delete_field(soft_delete_field.clone());
    }
    if let Some(fields) = &dst.fields {
        destination = destination.with_fields(fields.clone());
    }
    if let Some(indexes) = &dst.indexes {
        destination = destination.with_indexes(indexes.clone());
    }
    if !dst.after_create.is_empty() {
        destination = destination.with_after_create(Arc::new(SqlHook::new(dst.after_create.clone())));
    }

    Ok(Link {
        name: link.name.clone(),
        copier: Copier::new(source, destination),
    })
}
