// ABOUTME: Sync sources - a live table or an arbitrary query
// ABOUTME: Describes the source schema and streams rows as CSV via COPY TO STDOUT

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio_postgres::CopyOutStream;

use crate::error::{Result, SyncError};
use crate::postgres::{ConnectionGuard, ConnectionProvider};
use crate::schema::{ddl, Field, Index};
use crate::utils::{quote_ident, quote_ident_list};

/// Derives a primary key name from a table name when the catalog has none.
pub type PrimaryKeyInference = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Key used when neither the catalog nor an inference function names one.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Source schema captured once per sync run.
#[derive(Debug, Clone)]
pub struct SourceSchema {
    pub fields: Vec<Field>,
    pub primary_key: Option<String>,
    pub indexes: Vec<Index>,
}

impl SourceSchema {
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn fields_ddl(&self) -> String {
        ddl::fields_ddl(&self.fields)
    }
}

/// A table read from its own connection.
pub struct TableSource {
    pub table: String,
    provider: Arc<dyn ConnectionProvider>,
    infer_primary_key: Option<PrimaryKeyInference>,
}

impl TableSource {
    pub fn new(table: impl Into<String>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            table: table.into(),
            provider,
            infer_primary_key: None,
        }
    }

    pub fn with_primary_key_inference(mut self, infer: PrimaryKeyInference) -> Self {
        self.infer_primary_key = Some(infer);
        self
    }

    fn fallback_primary_key(&self) -> String {
        match &self.infer_primary_key {
            Some(infer) => {
                let inferred = infer(&self.table);
                tracing::warn!(
                    "No explicit PK found for {}. Falling back to {}.",
                    self.table,
                    inferred
                );
                inferred
            }
            None => {
                tracing::warn!(
                    "No explicit PK found for {}. Falling back to \"{}\".",
                    self.table,
                    DEFAULT_PRIMARY_KEY
                );
                DEFAULT_PRIMARY_KEY.to_string()
            }
        }
    }
}

/// An arbitrary query taken verbatim. Has no indexes and no primary key.
pub struct QuerySource {
    pub query: String,
    provider: Arc<dyn ConnectionProvider>,
}

impl QuerySource {
    pub fn new(query: impl Into<String>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            query: query.into(),
            provider,
        }
    }
}

/// Where a link reads its rows from.
pub enum Source {
    Table(TableSource),
    Query(QuerySource),
}

impl Source {
    pub fn table(table: impl Into<String>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Source::Table(TableSource::new(table, provider))
    }

    pub fn query(query: impl Into<String>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Source::Query(QuerySource::new(query, provider))
    }

    pub fn provider(&self) -> &dyn ConnectionProvider {
        match self {
            Source::Table(t) => t.provider.as_ref(),
            Source::Query(q) => q.provider.as_ref(),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Source::Query(_))
    }

    /// Capture fields, primary key and viable indexes on one connection.
    pub async fn describe(&self) -> Result<SourceSchema> {
        let conn = self.provider().acquire().await?;

        match self {
            Source::Table(t) => {
                let fields = ddl::table_fields(&conn, &t.table).await?;
                if fields.is_empty() {
                    return Err(SyncError::InvalidOperation(format!(
                        "source table {} does not exist or has no columns",
                        t.table
                    )));
                }
                let primary_key = match ddl::primary_key(&conn, &t.table).await? {
                    Some(pk) => pk,
                    None => t.fallback_primary_key(),
                };
                let indexes = ddl::indexes(&conn, &t.table)
                    .await?
                    .into_iter()
                    .filter(|index| index.is_viable(&field_names(&fields)))
                    .collect();

                Ok(SourceSchema {
                    fields,
                    primary_key: Some(primary_key),
                    indexes,
                })
            }
            Source::Query(q) => Ok(SourceSchema {
                fields: ddl::query_fields(&conn, &q.query).await?,
                primary_key: None,
                indexes: Vec::new(),
            }),
        }
    }

    pub async fn fields(&self) -> Result<Vec<Field>> {
        let conn = self.provider().acquire().await?;
        match self {
            Source::Table(t) => ddl::table_fields(&conn, &t.table).await,
            Source::Query(q) => ddl::query_fields(&conn, &q.query).await,
        }
    }

    pub async fn fields_ddl(&self) -> Result<String> {
        Ok(ddl::fields_ddl(&self.fields().await?))
    }

    pub async fn indexes(&self) -> Result<Vec<Index>> {
        Ok(self.describe().await?.indexes)
    }

    /// Declared or inferred primary key; `None` for queries.
    pub async fn primary_key(&self) -> Result<Option<String>> {
        match self {
            Source::Table(t) => {
                let conn = t.provider.acquire().await?;
                Ok(Some(match ddl::primary_key(&conn, &t.table).await? {
                    Some(pk) => pk,
                    None => t.fallback_primary_key(),
                }))
            }
            Source::Query(_) => Ok(None),
        }
    }

    /// Set-based SELECT over the source. Queries ignore `fields` and
    /// `filter` and are used verbatim.
    pub fn select_sql(&self, fields: &[String], filter: Option<&str>) -> String {
        match self {
            Source::Table(t) => {
                let mut sql = format!(
                    "SELECT {} FROM {}",
                    quote_ident_list(fields),
                    quote_ident(&t.table)
                );
                if let Some(filter) = filter {
                    sql.push_str(" WHERE ");
                    sql.push_str(filter);
                }
                sql
            }
            Source::Query(q) => q.query.clone(),
        }
    }

    pub fn copy_out_sql(&self, fields: &[String], filter: Option<&str>) -> String {
        format!("COPY ({}) TO STDOUT CSV", self.select_sql(fields, filter))
    }

    /// Open a CSV export on the source's own connection.
    ///
    /// The connection stays borrowed until the returned stream is dropped.
    pub async fn copy_out(&self, fields: &[String], filter: Option<&str>) -> Result<RowStream> {
        let sql = self.copy_out_sql(fields, filter);
        tracing::debug!("Source export: {}", sql);

        let conn = self.provider().acquire().await?;
        let stream = conn.copy_out(sql.as_str()).await?;

        Ok(RowStream {
            rows: Box::pin(stream),
            _conn: conn,
        })
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Table(t) => f.write_str(&t.table),
            Source::Query(q) => write!(f, "query ({})", q.query),
        }
    }
}

fn field_names(fields: &[Field]) -> Vec<String> {
    fields.iter().map(|f| f.name.clone()).collect()
}

/// One CSV-encoded row at a time from a source export.
///
/// Dropping the stream before it is drained abandons the export; the
/// connection guard is released after the stream itself.
pub struct RowStream {
    rows: Pin<Box<CopyOutStream>>,
    _conn: ConnectionGuard,
}

impl RowStream {
    /// Next encoded row, or `None` at end of stream.
    pub async fn next_row(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rows.next().await.transpose()?)
    }
}

/// `"<sequence_field>" > '<value>'`
pub fn sequence_filter(sequence_field: &str, since: &str) -> String {
    format!(
        "{} > {}",
        quote_ident(sequence_field),
        crate::utils::quote_literal(since)
    )
}
