// ABOUTME: Destination table - owns the target relation and applies deltas to it
// ABOUTME: Transactional DDL, temp staging, COPY ingest, upsert, delete detection and views

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio_postgres::{Client, Transaction};

use crate::error::{Result, SyncError};
use crate::postgres::{shares_connection, ConnectionGuard, ConnectionProvider};
use crate::schema::{plan_indexes, Index, TableDescriptor, View};
use crate::source::{sequence_filter, Source, SourceSchema};
use crate::utils::{quote_ident, quote_ident_list};

/// Views whose rewrite rules reference columns of the table named by `$1`.
pub const DEPENDENT_VIEWS_SQL: &str = "
    SELECT schemaname::text, viewname::text, definition
    FROM pg_views
    WHERE viewname IN (
        SELECT DISTINCT dependee.relname
        FROM pg_depend
        JOIN pg_rewrite ON pg_depend.objid = pg_rewrite.oid
        JOIN pg_class AS dependee ON pg_rewrite.ev_class = dependee.oid
        JOIN pg_class AS dependent ON pg_depend.refobjid = dependent.oid
        JOIN pg_attribute ON pg_depend.refobjid = pg_attribute.attrelid
            AND pg_depend.refobjsubid = pg_attribute.attnum
        WHERE dependent.relname = $1
          AND pg_attribute.attnum > 0)
    ORDER BY viewname";

/// Runs after the destination table has been created, inside the same
/// transaction.
#[async_trait]
pub trait AfterCreate: Send + Sync {
    async fn after_create(&self, tx: &Transaction<'_>, table: &str) -> Result<()>;
}

/// SQL statements run after table creation. `{table}` is replaced with the
/// quoted table name.
#[derive(Debug, Clone, Default)]
pub struct SqlHook {
    pub statements: Vec<String>,
}

impl SqlHook {
    pub fn new(statements: Vec<String>) -> Self {
        Self { statements }
    }

    pub fn render(&self, table: &str) -> Vec<String> {
        let quoted = quote_ident(table);
        self.statements
            .iter()
            .map(|sql| sql.replace("{table}", &quoted))
            .collect()
    }
}

#[async_trait]
impl AfterCreate for SqlHook {
    async fn after_create(&self, tx: &Transaction<'_>, table: &str) -> Result<()> {
        for sql in self.render(table) {
            tracing::debug!("After-create hook on {}: {}", table, sql);
            tx.batch_execute(&sql).await?;
        }
        Ok(())
    }
}

/// Options for [`Destination::bulk_load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Load into the transaction's staging table instead of the live table.
    pub temp: bool,
    /// Copy only the primary key column.
    pub primary_key_only: bool,
    /// Only rows whose sequence field is greater than this value.
    pub since_sequence: Option<String>,
}

/// The table rows are synced into.
pub struct Destination {
    table: String,
    provider: Arc<dyn ConnectionProvider>,
    primary_key: Option<String>,
    sequence_field: Option<String>,
    fields: Option<Vec<String>>,
    indexes: Option<Vec<Vec<String>>>,
    auto_index: bool,
    soft_delete_field: Option<String>,
    after_create: Option<Arc<dyn AfterCreate>>,
}

impl Destination {
    pub fn new(table: impl Into<String>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            table: table.into(),
            provider,
            primary_key: None,
            sequence_field: None,
            fields: None,
            indexes: None,
            auto_index: true,
            soft_delete_field: None,
            after_create: None,
        }
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = Some(primary_key.into());
        self
    }

    pub fn with_sequence_field(mut self, sequence_field: impl Into<String>) -> Self {
        self.sequence_field = Some(sequence_field.into());
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_indexes(mut self, indexes: Vec<Vec<String>>) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn with_auto_index(mut self, auto_index: bool) -> Self {
        self.auto_index = auto_index;
        self
    }

    pub fn with_soft_delete_field(mut self, soft_delete_field: impl Into<String>) -> Self {
        self.soft_delete_field = Some(soft_delete_field.into());
        self
    }

    pub fn with_after_create(mut self, hook: Arc<dyn AfterCreate>) -> Self {
        self.after_create = Some(hook);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn provider(&self) -> &dyn ConnectionProvider {
        self.provider.as_ref()
    }

    pub fn sequence_field(&self) -> Option<&str> {
        self.sequence_field.as_deref()
    }

    pub async fn acquire(&self) -> Result<ConnectionGuard> {
        self.provider.acquire().await
    }

    /// Resolve configuration against the source's schema for one run.
    pub fn describe(&self, schema: &SourceSchema) -> TableDescriptor {
        let fields = self
            .fields
            .clone()
            .unwrap_or_else(|| schema.field_names());

        let base_indexes: Vec<Index> = match &self.indexes {
            Some(configured) => configured
                .iter()
                .map(|columns| Index::new(self.table.clone(), None, columns.clone()))
                .collect(),
            None => schema.indexes.clone(),
        };

        TableDescriptor {
            name: self.table.clone(),
            primary_key: self
                .primary_key
                .clone()
                .or_else(|| schema.primary_key.clone()),
            sequence_field: self.sequence_field.clone(),
            indexes: plan_indexes(
                &self.table,
                &fields,
                &schema.fields,
                &base_indexes,
                self.auto_index,
            ),
            fields,
            soft_delete_field: self.soft_delete_field.clone(),
        }
    }

    /// True when the table has no rows. Fails with
    /// [`SyncError::TableMissing`] when the table does not exist.
    pub async fn none(&self, client: &Client) -> Result<bool> {
        let row = client.query_one(none_sql(&self.table).as_str(), &[]).await?;
        let has_rows: bool = row.get(0);
        Ok(!has_rows)
    }

    /// Largest sequence value currently in the table, rendered as text.
    pub async fn max_sequence(&self, client: &Client) -> Result<Option<String>> {
        let Some(sequence_field) = &self.sequence_field else {
            return Ok(None);
        };
        let row = client
            .query_one(max_sequence_sql(&self.table, sequence_field).as_str(), &[])
            .await?;
        Ok(row.get(0))
    }

    pub async fn create(&self, tx: &Transaction<'_>, fields_ddl: &str) -> Result<()> {
        let sql = create_sql(&self.table, fields_ddl, self.soft_delete_field.as_deref());
        tracing::debug!("{}", sql);
        tx.batch_execute(&sql).await?;
        self.run_after_create(tx).await
    }

    pub async fn drop(&self, tx: &Transaction<'_>, cascade: bool) -> Result<()> {
        tx.batch_execute(&drop_sql(&self.table, cascade)).await?;
        Ok(())
    }

    /// Staging table dropped when the transaction ends.
    pub async fn create_temp(&self, tx: &Transaction<'_>, fields_ddl: &str) -> Result<()> {
        tx.batch_execute(&create_temp_sql(&self.table, fields_ddl))
            .await?;
        Ok(())
    }

    /// Create every planned index against the current table name.
    pub async fn create_indexes(
        &self,
        tx: &Transaction<'_>,
        desc: &TableDescriptor,
    ) -> Result<usize> {
        for index in &desc.indexes {
            let sql = index.retarget(&desc.name).create_sql();
            tracing::debug!("{}", sql);
            tx.batch_execute(&sql).await?;
        }
        Ok(desc.indexes.len())
    }

    /// Move rows from `source` into the live or staging table.
    ///
    /// When both ends share one physical connection the rows are moved with a
    /// single `INSERT ... SELECT`, since the connection cannot serve a COPY
    /// out and a COPY in at once. Otherwise rows are relayed one at a time
    /// from the source's COPY out into this transaction's COPY in.
    ///
    /// Returns the number of rows moved.
    pub async fn bulk_load(
        &self,
        tx: &Transaction<'_>,
        source: &Source,
        desc: &TableDescriptor,
        opts: &LoadOptions,
    ) -> Result<u64> {
        let target = if opts.temp {
            desc.temp_name()
        } else {
            desc.name.clone()
        };

        let fields = if opts.primary_key_only {
            vec![require_primary_key(desc)?.to_string()]
        } else {
            desc.fields.clone()
        };

        let filter = match (&opts.since_sequence, &desc.sequence_field) {
            (Some(since), Some(sequence_field)) => Some(sequence_filter(sequence_field, since)),
            _ => None,
        };

        if shares_connection(source.provider(), self.provider()) {
            let sql = insert_select_sql(
                &target,
                &fields,
                &source.select_sql(&fields, filter.as_deref()),
            );
            tracing::debug!("{}", sql);
            return Ok(tx.execute(sql.as_str(), &[]).await?);
        }

        let mut rows = source.copy_out(&fields, filter.as_deref()).await?;
        let sink = tx
            .copy_in::<_, Bytes>(copy_in_sql(&target, &fields).as_str())
            .await?;
        tokio::pin!(sink);

        let mut count = 0u64;
        while let Some(row) = rows.next_row().await? {
            count += 1;
            sink.send(row).await?;
        }
        sink.finish().await?;

        Ok(count)
    }

    /// Full rebuild on a shared connection: materialize the source select as
    /// the destination table in one statement.
    pub async fn select_into(
        &self,
        tx: &Transaction<'_>,
        source: &Source,
        desc: &TableDescriptor,
    ) -> Result<u64> {
        let sql = select_into_sql(&desc.name, &source.select_sql(&desc.fields, None));
        tracing::debug!("{}", sql);
        let moved = tx.execute(sql.as_str(), &[]).await?;

        if let Some(soft_delete_field) = &self.soft_delete_field {
            tx.batch_execute(&add_soft_delete_sql(&desc.name, soft_delete_field))
                .await?;
        }
        self.run_after_create(tx).await?;

        Ok(moved)
    }

    /// Merge staged rows into the live table. `except` narrows the staged
    /// rows, normally to those that differ from the live table.
    pub async fn upsert_from_temp(
        &self,
        tx: &Transaction<'_>,
        desc: &TableDescriptor,
        except: Option<&str>,
    ) -> Result<u64> {
        let sql = upsert_sql(desc, except)?;
        Ok(tx.execute(sql.as_str(), &[]).await?)
    }

    /// Remove, or flag when a soft-delete field is configured, rows whose
    /// primary key is absent from the staging table.
    pub async fn delete_not_in_temp(
        &self,
        tx: &Transaction<'_>,
        desc: &TableDescriptor,
    ) -> Result<u64> {
        let sql = delete_not_in_temp_sql(desc)?;
        tracing::debug!("{}", sql);
        Ok(tx.execute(sql.as_str(), &[]).await?)
    }

    pub async fn query_dependent_views(&self, tx: &Transaction<'_>) -> Result<Vec<View>> {
        let rows = tx.query(DEPENDENT_VIEWS_SQL, &[&self.table]).await?;
        Ok(rows
            .iter()
            .map(|row| View::new(row.get::<_, String>(0), row.get::<_, String>(1), row.get::<_, String>(2)))
            .collect())
    }

    /// Replay captured views. Each view runs under its own savepoint so one
    /// failure leaves the transaction usable; failures are reported as
    /// `false`.
    pub async fn recreate_views(
        &self,
        tx: &mut Transaction<'_>,
        views: &[View],
    ) -> Result<BTreeMap<String, bool>> {
        let mut status = BTreeMap::new();

        for view in views {
            let savepoint = tx.savepoint("recreate_view").await?;
            let created = match savepoint.batch_execute(&view.create_sql()).await {
                Ok(()) => {
                    savepoint.commit().await?;
                    tracing::info!("Recreated view {}", view.qualified_name());
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to recreate view {}: {}",
                        view.qualified_name(),
                        e
                    );
                    savepoint.rollback().await?;
                    false
                }
            };
            status.insert(view.name.clone(), created);
        }

        Ok(status)
    }

    async fn run_after_create(&self, tx: &Transaction<'_>) -> Result<()> {
        match &self.after_create {
            Some(hook) => hook.after_create(tx, &self.table).await,
            None => Ok(()),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table)
    }
}

fn require_primary_key(desc: &TableDescriptor) -> Result<&str> {
    desc.primary_key.as_deref().ok_or_else(|| {
        SyncError::InvalidOperation(format!("no primary key configured for {}", desc.name))
    })
}

pub fn none_sql(table: &str) -> String {
    format!("SELECT EXISTS (SELECT 1 FROM {})", quote_ident(table))
}

pub fn max_sequence_sql(table: &str, sequence_field: &str) -> String {
    format!(
        "SELECT max({})::text FROM {}",
        quote_ident(sequence_field),
        quote_ident(table)
    )
}

pub fn create_sql(table: &str, fields_ddl: &str, soft_delete_field: Option<&str>) -> String {
    let soft_delete = soft_delete_field
        .map(|field| format!(", {} bool default false", quote_ident(field)))
        .unwrap_or_default();
    format!(
        "CREATE TABLE {} ({}{})",
        quote_ident(table),
        fields_ddl,
        soft_delete
    )
}

pub fn drop_sql(table: &str, cascade: bool) -> String {
    let mut sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
    if cascade {
        sql.push_str(" CASCADE");
    }
    sql
}

pub fn create_temp_sql(table: &str, fields_ddl: &str) -> String {
    format!(
        "CREATE TEMP TABLE {} ({}) ON COMMIT DROP",
        quote_ident(&crate::schema::temp_table_name(table)),
        fields_ddl
    )
}

pub fn copy_in_sql(target: &str, fields: &[String]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN CSV",
        quote_ident(target),
        quote_ident_list(fields)
    )
}

pub fn insert_select_sql(target: &str, fields: &[String], select: &str) -> String {
    format!(
        "INSERT INTO {} ({}) SELECT * FROM ({}) AS source_rows",
        quote_ident(target),
        quote_ident_list(fields),
        select
    )
}

pub fn select_into_sql(table: &str, select: &str) -> String {
    format!(
        "SELECT * INTO {} FROM ({}) AS source_rows",
        quote_ident(table),
        select
    )
}

pub fn add_soft_delete_sql(table: &str, soft_delete_field: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} bool default false",
        quote_ident(table),
        quote_ident(soft_delete_field)
    )
}

/// `EXCEPT SELECT <fields> FROM <table>`: keeps only staged rows that differ
/// from the live table.
pub fn except_clause(desc: &TableDescriptor) -> String {
    format!(
        "EXCEPT SELECT {} FROM {}",
        quote_ident_list(&desc.fields),
        quote_ident(&desc.name)
    )
}

pub fn upsert_sql(desc: &TableDescriptor, except: Option<&str>) -> Result<String> {
    let pk = quote_ident(require_primary_key(desc)?);
    let table = quote_ident(&desc.name);
    let fields = quote_ident_list(&desc.fields);

    let set = desc
        .fields
        .iter()
        .map(|f| {
            let f = quote_ident(f);
            format!("{}=nv.{}", f, f)
        })
        .collect::<Vec<_>>()
        .join(",");
    let returning = desc
        .fields
        .iter()
        .map(|f| format!("nv.{}", quote_ident(f)))
        .collect::<Vec<_>>()
        .join(",");

    Ok(format!(
        "WITH new_values AS (
  SELECT {fields} FROM {temp} {except}
),
upsert AS (
  UPDATE {table} SET {set}
  FROM new_values nv WHERE {table}.{pk} = nv.{pk}
  RETURNING {returning}
)
INSERT INTO {table} ({fields})
  SELECT * FROM new_values nv
  WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {table}.{pk} = nv.{pk});",
        temp = quote_ident(&desc.temp_name()),
        except = except.unwrap_or(""),
    ))
}

fn not_in_temp(desc: &TableDescriptor) -> Result<String> {
    let pk = quote_ident(require_primary_key(desc)?);
    Ok(format!(
        "{pk} IN (SELECT {pk} FROM {} EXCEPT SELECT {pk} FROM {})",
        quote_ident(&desc.name),
        quote_ident(&desc.temp_name())
    ))
}

pub fn delete_not_in_temp_sql(desc: &TableDescriptor) -> Result<String> {
    let table = quote_ident(&desc.name);
    let not_in_temp = not_in_temp(desc)?;
    Ok(match &desc.soft_delete_field {
        Some(field) => {
            let field = quote_ident(field);
            format!(
                "UPDATE {table} SET {field} = true WHERE {not_in_temp} AND ({field} IS NULL OR {field} != true)"
            )
        }
        None => format!("DELETE FROM {table} WHERE {not_in_temp}"),
    })
}
