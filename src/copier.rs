// ABOUTME: Copier - orchestrates syncing one source into one destination table
// ABOUTME: Picks a strategy, recovers from schema drift, runs each strategy in one transaction

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::destination::{except_clause, Destination, LoadOptions};
use crate::error::{Result, SyncError};
use crate::postgres::shares_connection;
use crate::schema::TableDescriptor;
use crate::source::{Source, SourceSchema};

/// How a sync run moved data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Drop, recreate, bulk load, reindex, re-view.
    Droppy,
    /// Stage rows past the current sequence maximum, then upsert.
    Incremental,
    /// Stage rows that differ from the live table, then upsert.
    DiffyUpdate,
    /// Stage every row, upsert, then delete rows absent from the source.
    Diffy,
    /// Stage primary keys only, then delete rows absent from the source.
    FindDeletes,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Droppy => "droppy",
            Strategy::Incremental => "incremental",
            Strategy::DiffyUpdate => "diffy_update",
            Strategy::Diffy => "diffy",
            Strategy::FindDeletes => "find_deletes",
        };
        f.write_str(name)
    }
}

/// The branch `update` takes for the current destination state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Droppy,
    Incremental { since: String },
    DiffyUpdate,
}

impl Plan {
    /// Empty destinations and query sources are always rebuilt. A sequence
    /// maximum selects the incremental path, anything else a diffy update.
    ///
    /// Neither incremental nor diffy update detects deletes.
    pub fn choose(destination_empty: bool, source_is_query: bool, max_sequence: Option<String>) -> Plan {
        if destination_empty || source_is_query {
            return Plan::Droppy;
        }
        match max_sequence {
            Some(since) => Plan::Incremental { since },
            None => Plan::DiffyUpdate,
        }
    }
}

/// What `update` does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Create the destination table from the source schema and retry once.
    CreateAndRetry,
    /// Fall back to a full rebuild, without retrying the update.
    Rebuild,
    /// Surface the error unchanged.
    Fail,
}

impl Recovery {
    pub fn for_error(err: &SyncError, already_created: bool) -> Recovery {
        if !err.is_schema_drift() {
            return Recovery::Fail;
        }
        match err {
            SyncError::TableMissing(_) if !already_created => Recovery::CreateAndRetry,
            SyncError::ColumnMissing(_) => Recovery::Rebuild,
            _ => Recovery::Fail,
        }
    }
}

/// Outcome of one copier operation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub strategy: Strategy,
    /// Rows moved into the live table or the staging table.
    pub rows_moved: u64,
    /// Rows deleted, or flagged when soft deletes are configured.
    pub rows_deleted_or_flagged: u64,
    pub indexes_created: usize,
    /// Recreated views by name; `false` if the view could not be recreated.
    pub views: BTreeMap<String, bool>,
}

impl SyncReport {
    fn new(table: &str, strategy: Strategy) -> Self {
        Self {
            table: table.to_string(),
            strategy,
            rows_moved: 0,
            rows_deleted_or_flagged: 0,
            indexes_created: 0,
            views: BTreeMap::new(),
        }
    }
}

/// Syncs one source into one destination.
///
/// Every operation describes the source afresh before touching the
/// destination, so a source connection is never requested while the
/// destination transaction holds a shared connection.
pub struct Copier {
    source: Source,
    destination: Destination,
}

impl Copier {
    pub fn new(source: Source, destination: Destination) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Bring the destination up to date with the cheapest applicable
    /// strategy.
    ///
    /// A missing destination table is created and the update retried once.
    /// A missing column falls back to a full rebuild.
    pub async fn update(&self) -> Result<SyncReport> {
        let mut created = false;

        loop {
            let err = match self.try_update().await {
                Ok(report) => return Ok(report),
                Err(err) => err,
            };

            match Recovery::for_error(&err, created) {
                Recovery::CreateAndRetry => {
                    tracing::warn!("{}: {}", self.destination, err);
                    self.create_table().await?;
                    created = true;
                }
                Recovery::Rebuild => {
                    tracing::warn!("{}: {}", self.destination, err);
                    return self.droppy().await;
                }
                Recovery::Fail => return Err(err),
            }
        }
    }

    /// Full destructive rebuild.
    pub async fn droppy(&self) -> Result<SyncReport> {
        let schema = self.source.describe().await?;
        let desc = self.destination.describe(&schema);
        self.rebuild(&schema, &desc).await
    }

    /// Full reconciliation: upsert every changed row, then delete rows that
    /// are gone from the source.
    pub async fn diffy(&self) -> Result<SyncReport> {
        self.reject_query_source(Strategy::Diffy)?;

        let schema = self.source.describe().await?;
        let desc = self.destination.describe(&schema);
        tracing::info!("Diffy {}", desc.name);

        let mut report = SyncReport::new(&desc.name, Strategy::Diffy);
        let mut conn = self.destination.acquire().await?;
        let tx = conn.transaction().await?;

        report.rows_moved = self
            .stage(&tx, &schema, &desc, LoadOptions { temp: true, ..Default::default() })
            .await?;
        self.destination
            .upsert_from_temp(&tx, &desc, Some(&except_clause(&desc)))
            .await?;
        tracing::info!("Upsert to {} complete", desc.name);
        report.rows_deleted_or_flagged = self.destination.delete_not_in_temp(&tx, &desc).await?;
        tracing::info!(
            "Deletions from {} complete ({} rows).",
            desc.name,
            report.rows_deleted_or_flagged
        );

        tx.commit().await?;
        Ok(report)
    }

    /// Delete, or flag, destination rows whose primary key no longer exists
    /// in the source. Only primary keys are transferred.
    pub async fn find_deletes(&self) -> Result<SyncReport> {
        self.reject_query_source(Strategy::FindDeletes)?;

        let schema = self.source.describe().await?;
        let desc = self.destination.describe(&schema);
        tracing::info!("Find deletes {}", desc.name);

        let mut report = SyncReport::new(&desc.name, Strategy::FindDeletes);
        let mut conn = self.destination.acquire().await?;
        let tx = conn.transaction().await?;

        let opts = LoadOptions {
            temp: true,
            primary_key_only: true,
            since_sequence: None,
        };
        report.rows_moved = self.stage(&tx, &schema, &desc, opts).await?;
        report.rows_deleted_or_flagged = self.destination.delete_not_in_temp(&tx, &desc).await?;
        tracing::info!(
            "Deletions from {} complete ({} rows).",
            desc.name,
            report.rows_deleted_or_flagged
        );

        tx.commit().await?;
        Ok(report)
    }

    async fn try_update(&self) -> Result<SyncReport> {
        let schema = self.source.describe().await?;
        let desc = self.destination.describe(&schema);

        let plan = {
            let conn = self.destination.acquire().await?;
            let empty = self.destination.none(&conn).await?;
            let max_sequence = if empty {
                None
            } else {
                self.destination.max_sequence(&conn).await?
            };
            Plan::choose(empty, self.source.is_query(), max_sequence)
        };

        match plan {
            Plan::Droppy => self.rebuild(&schema, &desc).await,
            Plan::Incremental { since } => self.incremental(&schema, &desc, since).await,
            Plan::DiffyUpdate => self.diffy_update(&schema, &desc).await,
        }
    }

    async fn rebuild(&self, schema: &SourceSchema, desc: &TableDescriptor) -> Result<SyncReport> {
        tracing::info!("Droppy {}", desc.name);

        let mut report = SyncReport::new(&desc.name, Strategy::Droppy);
        let mut conn = self.destination.acquire().await?;
        let mut tx = conn.transaction().await?;

        let views = self.destination.query_dependent_views(&tx).await?;
        self.destination.drop(&tx, true).await?;

        report.rows_moved = if shares_connection(self.source.provider(), self.destination.provider()) {
            self.destination.select_into(&tx, &self.source, desc).await?
        } else {
            self.destination.create(&tx, &schema.fields_ddl()).await?;
            self.destination
                .bulk_load(&tx, &self.source, desc, &LoadOptions::default())
                .await?
        };
        tracing::info!("{} rows moved to {}", report.rows_moved, desc.name);

        report.indexes_created = self.destination.create_indexes(&tx, desc).await?;
        tracing::info!("Completed {} indexes on {}.", report.indexes_created, desc.name);

        report.views = self.destination.recreate_views(&mut tx, &views).await?;

        tx.commit().await?;
        Ok(report)
    }

    async fn incremental(
        &self,
        schema: &SourceSchema,
        desc: &TableDescriptor,
        since: String,
    ) -> Result<SyncReport> {
        tracing::info!("Update {} since {}", desc.name, since);

        let mut report = SyncReport::new(&desc.name, Strategy::Incremental);
        let mut conn = self.destination.acquire().await?;
        let tx = conn.transaction().await?;

        let opts = LoadOptions {
            temp: true,
            primary_key_only: false,
            since_sequence: Some(since),
        };
        report.rows_moved = self.stage(&tx, schema, desc, opts).await?;
        self.destination.upsert_from_temp(&tx, desc, None).await?;
        tracing::info!("Upsert to {} complete.", desc.name);

        tx.commit().await?;
        Ok(report)
    }

    async fn diffy_update(&self, schema: &SourceSchema, desc: &TableDescriptor) -> Result<SyncReport> {
        tracing::info!("Diffy Update {}", desc.name);

        let mut report = SyncReport::new(&desc.name, Strategy::DiffyUpdate);
        let mut conn = self.destination.acquire().await?;
        let tx = conn.transaction().await?;

        report.rows_moved = self
            .stage(&tx, schema, desc, LoadOptions { temp: true, ..Default::default() })
            .await?;
        self.destination
            .upsert_from_temp(&tx, desc, Some(&except_clause(desc)))
            .await?;
        tracing::info!("Upsert to {} complete.", desc.name);

        tx.commit().await?;
        Ok(report)
    }

    /// Create the transaction's staging table and load it.
    async fn stage(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        schema: &SourceSchema,
        desc: &TableDescriptor,
        opts: LoadOptions,
    ) -> Result<u64> {
        self.destination.create_temp(tx, &schema.fields_ddl()).await?;
        let moved = self
            .destination
            .bulk_load(tx, &self.source, desc, &opts)
            .await?;
        tracing::info!("{} rows moved to {}", moved, desc.temp_name());
        Ok(moved)
    }

    async fn create_table(&self) -> Result<()> {
        let fields_ddl = self.source.describe().await?.fields_ddl();
        tracing::info!("Creating table {}", self.destination);

        let mut conn = self.destination.acquire().await?;
        let tx = conn.transaction().await?;
        self.destination.create(&tx, &fields_ddl).await?;
        tx.commit().await?;
        Ok(())
    }

    fn reject_query_source(&self, strategy: Strategy) -> Result<()> {
        if self.source.is_query() {
            return Err(SyncError::InvalidOperation(format!(
                "{} is not supported for query sources ({})",
                strategy, self.destination
            )));
        }
        Ok(())
    }
}
