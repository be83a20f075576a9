// ABOUTME: Schema introspection against live PostgreSQL catalogs
// ABOUTME: Derives fields, DDL fragments, primary keys and indexes for tables and queries

use std::collections::HashSet;

use tokio_postgres::{Client, Column};

use super::field::Field;
use super::index::Index;
use crate::error::{Result, SyncError};
use crate::utils::quote_ident;

/// Columns of a table in the current schema, in ordinal order.
pub const TABLE_FIELDS_SQL: &str = "
    SELECT column_name::text AS column_name,
           data_type::text AS data_type,
           udt_name::text AS udt_name,
           character_maximum_length::int AS character_maximum_length
    FROM information_schema.columns
    WHERE table_schema = current_schema() AND table_name = $1
    ORDER BY ordinal_position";

/// Primary key columns of a table, in key order.
pub const PRIMARY_KEY_SQL: &str = "
    SELECT a.attname::text
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
    JOIN pg_class c ON c.oid = i.indrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE i.indisprimary
      AND n.nspname = current_schema()
      AND c.relname = $1
    ORDER BY array_position(i.indkey, a.attnum)";

/// One row per (index, column) of a table's indexes, columns in key order.
pub const INDEXES_SQL: &str = "
    SELECT i.relname::text AS index_name,
           a.attname::text AS column_name
    FROM pg_class t
    JOIN pg_index ix ON t.oid = ix.indrelid
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
    JOIN pg_namespace n ON n.oid = t.relnamespace
    WHERE t.relkind = 'r'
      AND n.nspname = current_schema()
      AND t.relname = $1
    ORDER BY i.relname, array_position(ix.indkey, a.attnum)";

/// Temporary view used to read the declared result types of a query.
pub const FIELDS_VIEW: &str = "table_sync_fields";

/// Formatted types of [`FIELDS_VIEW`]'s columns, in result order.
pub const VIEW_TYPES_SQL: &str = "
    SELECT format_type(a.atttypid, a.atttypmod)
    FROM pg_attribute a
    WHERE a.attrelid = 'pg_temp.table_sync_fields'::regclass
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum";

/// Probe statement used to describe a query's result without running it.
pub fn probe_sql(query: &str) -> String {
    format!("SELECT * FROM ({}) fields_query LIMIT 0", query)
}

/// Fail with [`SyncError::DuplicateField`] on the first repeated name.
pub fn ensure_unique_names<'a, I>(names: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut used = HashSet::new();
    for name in names {
        if !used.insert(name) {
            return Err(SyncError::DuplicateField(name.to_string()));
        }
    }
    Ok(())
}

/// Render a field list as a column-definition block.
pub fn fields_ddl(fields: &[Field]) -> String {
    fields
        .iter()
        .map(Field::ddl)
        .collect::<Vec<_>>()
        .join(",\n  ")
}

pub fn create_fields_view_sql(query: &str) -> String {
    format!("CREATE OR REPLACE TEMP VIEW {} AS {}", FIELDS_VIEW, query)
}

pub fn drop_fields_view_sql() -> String {
    format!("DROP VIEW IF EXISTS pg_temp.{}", FIELDS_VIEW)
}

/// Build the `format_type` statement for a described result.
///
/// The row description carries no type modifier, so columns that come
/// straight from a table recover theirs from `pg_attribute` and computed
/// columns are formatted without one.
pub fn format_type_sql(columns: &[Column]) -> String {
    let expressions: Vec<String> = columns
        .iter()
        .map(|column| {
            let type_mod = match (column.table_oid(), column.column_id()) {
                (Some(table_oid), Some(column_id)) if table_oid != 0 && column_id > 0 => format!(
                    "coalesce((SELECT atttypmod FROM pg_attribute WHERE attrelid = {} AND attnum = {}), -1)",
                    table_oid, column_id
                ),
                _ => "-1".to_string(),
            };
            format!(
                "format_type({}, {}) AS {}",
                column.type_().oid(),
                type_mod,
                quote_ident(column.name())
            )
        })
        .collect();

    format!("SELECT {}", expressions.join(", "))
}

/// Fields of a live table.
pub async fn table_fields(client: &Client, table: &str) -> Result<Vec<Field>> {
    let rows = client.query(TABLE_FIELDS_SQL, &[&table]).await?;
    Ok(rows.iter().map(Field::from_row).collect())
}

/// Fields of an arbitrary query, typed by asking the server to format each
/// result column's type.
///
/// Types are read from a temporary view over the query, which keeps the
/// modifiers of computed columns such as `name::varchar(10)`. Where temporary
/// objects cannot be created (e.g. a hot standby) the prepared statement's
/// columns are formatted instead, and computed columns lose their modifier.
///
/// Fails with [`SyncError::DuplicateField`] when two result columns share a
/// name, e.g. `SELECT a.id, b.id FROM a JOIN b ...`.
pub async fn query_fields(client: &Client, query: &str) -> Result<Vec<Field>> {
    let statement = client.prepare(&probe_sql(query)).await?;
    let columns = statement.columns();

    ensure_unique_names(columns.iter().map(Column::name))?;

    if columns.is_empty() {
        return Ok(Vec::new());
    }

    let types = match view_types(client, query).await {
        Ok(types) if types.len() == columns.len() => types,
        Ok(types) => {
            tracing::debug!(
                "Temporary view reported {} columns, query has {}",
                types.len(),
                columns.len()
            );
            described_types(client, columns).await?
        }
        Err(e) => {
            tracing::debug!("Could not type query through a temporary view: {}", e);
            described_types(client, columns).await?
        }
    };

    Ok(columns
        .iter()
        .zip(types)
        .map(|(column, type_name)| Field::new(column.name(), type_name))
        .collect())
}

async fn view_types(client: &Client, query: &str) -> Result<Vec<String>> {
    client.batch_execute(&create_fields_view_sql(query)).await?;
    let rows = client.query(VIEW_TYPES_SQL, &[]).await;
    let dropped = client.batch_execute(&drop_fields_view_sql()).await;
    let rows = rows?;
    dropped?;
    Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
}

async fn described_types(client: &Client, columns: &[Column]) -> Result<Vec<String>> {
    let row = client.query_one(format_type_sql(columns).as_str(), &[]).await?;
    Ok((0..columns.len()).map(|i| row.get::<_, String>(i)).collect())
}

/// Declared primary key column, if the table has one.
///
/// Only the first key column is used for composite keys.
pub async fn primary_key(client: &Client, table: &str) -> Result<Option<String>> {
    let rows = client.query(PRIMARY_KEY_SQL, &[&table]).await?;
    Ok(first_key_column(rows.iter().map(|row| row.get::<_, String>(0))))
}

/// Leading column of a key listed in key order.
pub fn first_key_column<I>(columns: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    columns.into_iter().next()
}

/// Indexes of a live table.
pub async fn indexes(client: &Client, table: &str) -> Result<Vec<Index>> {
    let rows = client.query(INDEXES_SQL, &[&table]).await?;
    let pairs = rows
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)));
    Ok(group_index_columns(table, pairs))
}

/// Fold ordered (index, column) pairs into indexes.
pub fn group_index_columns<I>(table: &str, pairs: I) -> Vec<Index>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut indexes: Vec<Index> = Vec::new();
    for (index_name, column_name) in pairs {
        match indexes.last_mut() {
            Some(index) if index.name.as_deref() == Some(index_name.as_str()) => {
                index.columns.push(column_name);
            }
            _ => indexes.push(Index::new(table, Some(index_name), vec![column_name])),
        }
    }
    indexes
}
