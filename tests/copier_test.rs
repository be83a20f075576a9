// ABOUTME: Integration tests for the copier against live PostgreSQL databases
// ABOUTME: Covers rebuild, incremental, diff, delete detection, drift recovery and views

use std::env;
use std::sync::Arc;

use table_sync::copier::{Copier, Strategy};
use table_sync::destination::{Destination, SqlHook};
use table_sync::error::SyncError;
use table_sync::postgres::{ConnectionProvider, PgConnection};
use table_sync::source::{Source, TableSource};
use tokio_postgres::Client;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

struct Harness {
    source: Client,
    target: Client,
    source_provider: Arc<dyn ConnectionProvider>,
    target_provider: Arc<dyn ConnectionProvider>,
}

async fn harness() -> Harness {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");

    Harness {
        source: table_sync::postgres::connect(&source_url)
            .await
            .expect("Failed to connect to source"),
        target: table_sync::postgres::connect(&target_url)
            .await
            .expect("Failed to connect to target"),
        source_provider: Arc::new(PgConnection::new("source", source_url)),
        target_provider: Arc::new(PgConnection::new("target", target_url)),
    }
}

/// Create a source table holding ids 1, 2 and 3 and drop any leftover
/// destination table.
async fn setup(h: &Harness, src: &str, dst: &str) {
    h.source
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "{src}" CASCADE;
            CREATE TABLE "{src}" (
                id INTEGER PRIMARY KEY,
                name VARCHAR(20),
                updated_at TIMESTAMP
            );
            INSERT INTO "{src}" VALUES
                (1, 'one', '2024-01-01'),
                (2, 'two', '2024-01-02'),
                (3, 'three', '2024-01-03');
            "#
        ))
        .await
        .expect("Failed to set up source table");
    h.target
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{dst}" CASCADE"#))
        .await
        .expect("Failed to drop destination table");
}

async fn cleanup(h: &Harness, src: &str, dst: &str) {
    let _ = h
        .source
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{src}" CASCADE"#))
        .await;
    let _ = h
        .target
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{dst}" CASCADE"#))
        .await;
}

async fn ids(client: &Client, table: &str) -> Vec<i32> {
    client
        .query(&format!(r#"SELECT id FROM "{table}" ORDER BY id"#), &[])
        .await
        .expect("Failed to read ids")
        .iter()
        .map(|row| row.get(0))
        .collect()
}

async fn name_of(client: &Client, table: &str, id: i32) -> String {
    client
        .query_one(&format!(r#"SELECT name::text FROM "{table}" WHERE id = $1"#), &[&id])
        .await
        .expect("Failed to read name")
        .get(0)
}

fn table_copier(h: &Harness, src: &str, destination: Destination) -> Copier {
    Copier::new(Source::table(src, h.source_provider.clone()), destination)
}

#[tokio::test]
#[ignore]
async fn test_update_creates_missing_table_and_rebuilds() {
    let h = harness().await;
    let (src, dst) = ("ts_create_src", "ts_create_dst");
    setup(&h, src, dst).await;

    let destination = Destination::new(dst, h.target_provider.clone()).with_after_create(Arc::new(
        SqlHook::new(vec!["COMMENT ON TABLE {table} IS 'synced'".to_string()]),
    ));
    let report = table_copier(&h, src, destination).update().await.unwrap();

    assert_eq!(report.strategy, Strategy::Droppy);
    assert_eq!(report.rows_moved, 3);
    // Retargeted primary key index plus an automatic one on updated_at
    assert_eq!(report.indexes_created, 2);
    assert_eq!(ids(&h.target, dst).await, vec![1, 2, 3]);

    let length: i32 = h
        .target
        .query_one(
            "SELECT character_maximum_length::int FROM information_schema.columns
             WHERE table_name = $1 AND column_name = 'name'",
            &[&dst],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(length, 20);

    let comment: Option<String> = h
        .target
        .query_one(&format!("SELECT obj_description('\"{dst}\"'::regclass)"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(comment.as_deref(), Some("synced"));

    cleanup(&h, src, dst).await;
}

/// Incremental updates never detect deletes: row 1 survives in the
/// destination after being deleted from the source.
#[tokio::test]
#[ignore]
async fn test_incremental_update_appends_without_deletes() {
    let h = harness().await;
    let (src, dst) = ("ts_incr_src", "ts_incr_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(
        &h,
        src,
        Destination::new(dst, h.target_provider.clone()).with_sequence_field("updated_at"),
    );
    copier.update().await.unwrap();

    h.source
        .batch_execute(&format!(
            r#"
            INSERT INTO "{src}" VALUES (4, 'four', '2024-01-04');
            UPDATE "{src}" SET name = 'TWO', updated_at = '2024-01-05' WHERE id = 2;
            DELETE FROM "{src}" WHERE id = 1;
            "#
        ))
        .await
        .unwrap();

    let report = copier.update().await.unwrap();
    assert_eq!(report.strategy, Strategy::Incremental);
    assert_eq!(report.rows_moved, 2);
    assert_eq!(ids(&h.target, dst).await, vec![1, 2, 3, 4]);
    assert_eq!(name_of(&h.target, dst, 2).await, "TWO");

    cleanup(&h, src, dst).await;
}

/// Diffy update upserts changed rows but, like incremental, leaves rows
/// deleted from the source in place.
#[tokio::test]
#[ignore]
async fn test_diffy_update_upserts_without_deletes() {
    let h = harness().await;
    let (src, dst) = ("ts_dupd_src", "ts_dupd_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(&h, src, Destination::new(dst, h.target_provider.clone()));
    copier.update().await.unwrap();

    h.source
        .batch_execute(&format!(
            r#"
            UPDATE "{src}" SET name = 'TWO' WHERE id = 2;
            DELETE FROM "{src}" WHERE id = 1;
            INSERT INTO "{src}" VALUES (4, 'four', '2024-01-04');
            "#
        ))
        .await
        .unwrap();

    let report = copier.update().await.unwrap();
    assert_eq!(report.strategy, Strategy::DiffyUpdate);
    assert_eq!(report.rows_moved, 3);
    assert_eq!(ids(&h.target, dst).await, vec![1, 2, 3, 4]);
    assert_eq!(name_of(&h.target, dst, 2).await, "TWO");

    let count: i64 = h
        .target
        .query_one(&format!(r#"SELECT count(*) FROM "{dst}" WHERE id = 2"#), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 1);

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_diffy_reconciles_inserts_and_deletes() {
    let h = harness().await;
    let (src, dst) = ("ts_diffy_src", "ts_diffy_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(&h, src, Destination::new(dst, h.target_provider.clone()));
    copier.droppy().await.unwrap();

    h.source
        .batch_execute(&format!(
            r#"
            DELETE FROM "{src}" WHERE id = 1;
            INSERT INTO "{src}" VALUES (4, 'four', '2024-01-04');
            "#
        ))
        .await
        .unwrap();

    let report = copier.diffy().await.unwrap();
    assert_eq!(report.strategy, Strategy::Diffy);
    assert_eq!(report.rows_deleted_or_flagged, 1);
    assert_eq!(ids(&h.target, dst).await, vec![2, 3, 4]);

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_diffy_refreshes_values_and_is_idempotent() {
    let h = harness().await;
    let (src, dst) = ("ts_diffy_twice_src", "ts_diffy_twice_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(&h, src, Destination::new(dst, h.target_provider.clone()));
    copier.droppy().await.unwrap();

    h.source
        .batch_execute(&format!(
            r#"
            UPDATE "{src}" SET name = 'TWO' WHERE id = 2;
            DELETE FROM "{src}" WHERE id = 1;
            INSERT INTO "{src}" VALUES (4, 'four', '2024-01-04');
            "#
        ))
        .await
        .unwrap();

    let first = copier.diffy().await.unwrap();
    assert_eq!(first.rows_deleted_or_flagged, 1);
    assert_eq!(ids(&h.target, dst).await, vec![2, 3, 4]);
    assert_eq!(name_of(&h.target, dst, 2).await, "TWO");
    assert_eq!(name_of(&h.target, dst, 3).await, "three");

    let second = copier.diffy().await.unwrap();
    assert_eq!(second.rows_deleted_or_flagged, 0);
    assert_eq!(ids(&h.target, dst).await, vec![2, 3, 4]);
    assert_eq!(name_of(&h.target, dst, 2).await, "TWO");

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_composite_primary_key_uses_leading_column() {
    let h = harness().await;
    let (src, dst) = ("ts_pk2_src", "ts_pk2_dst");
    h.source
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "{src}" CASCADE;
            CREATE TABLE "{src}" (a INTEGER, b INTEGER, v TEXT, PRIMARY KEY (a, b));
            INSERT INTO "{src}" VALUES (1, 1, 'x'), (2, 1, 'y');
            "#
        ))
        .await
        .unwrap();
    h.target
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{dst}" CASCADE"#))
        .await
        .unwrap();

    let source = Source::table(src, h.source_provider.clone());
    assert_eq!(source.primary_key().await.unwrap().as_deref(), Some("a"));

    let copier = Copier::new(source, Destination::new(dst, h.target_provider.clone()));
    let report = copier.update().await.unwrap();
    assert_eq!(report.strategy, Strategy::Droppy);
    assert_eq!(report.rows_moved, 2);

    let count: i64 = h
        .target
        .query_one(&format!(r#"SELECT count(*) FROM "{dst}""#), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 2);

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_find_deletes_hard_delete() {
    let h = harness().await;
    let (src, dst) = ("ts_fdel_src", "ts_fdel_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(&h, src, Destination::new(dst, h.target_provider.clone()));
    copier.droppy().await.unwrap();

    h.source
        .batch_execute(&format!(r#"DELETE FROM "{src}" WHERE id = 3"#))
        .await
        .unwrap();

    let report = copier.find_deletes().await.unwrap();
    assert_eq!(report.strategy, Strategy::FindDeletes);
    assert_eq!(report.rows_moved, 2);
    assert_eq!(report.rows_deleted_or_flagged, 1);
    assert_eq!(ids(&h.target, dst).await, vec![1, 2]);

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_find_deletes_soft_delete_flags_once() {
    let h = harness().await;
    let (src, dst) = ("ts_soft_src", "ts_soft_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(
        &h,
        src,
        Destination::new(dst, h.target_provider.clone()).with_soft_delete_field("deleted"),
    );
    copier.droppy().await.unwrap();

    h.source
        .batch_execute(&format!(r#"DELETE FROM "{src}" WHERE id = 1"#))
        .await
        .unwrap();

    let report = copier.find_deletes().await.unwrap();
    assert_eq!(report.rows_deleted_or_flagged, 1);
    assert_eq!(ids(&h.target, dst).await, vec![1, 2, 3]);

    let flagged: Vec<i32> = h
        .target
        .query(&format!(r#"SELECT id FROM "{dst}" WHERE deleted ORDER BY id"#), &[])
        .await
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect();
    assert_eq!(flagged, vec![1]);

    let again = copier.find_deletes().await.unwrap();
    assert_eq!(again.rows_deleted_or_flagged, 0);

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_new_source_column_falls_back_to_rebuild() {
    let h = harness().await;
    let (src, dst) = ("ts_drift_src", "ts_drift_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(&h, src, Destination::new(dst, h.target_provider.clone()));
    copier.update().await.unwrap();

    h.source
        .batch_execute(&format!(
            r#"
            ALTER TABLE "{src}" ADD COLUMN extra TEXT;
            UPDATE "{src}" SET extra = 'x';
            "#
        ))
        .await
        .unwrap();

    let report = copier.update().await.unwrap();
    assert_eq!(report.strategy, Strategy::Droppy);
    assert_eq!(report.rows_moved, 3);

    let extra: Option<String> = h
        .target
        .query_one(&format!(r#"SELECT extra FROM "{dst}" WHERE id = 1"#), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(extra.as_deref(), Some("x"));

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_rebuild_recreates_dependent_views() {
    let h = harness().await;
    let (src, dst) = ("ts_views_src", "ts_views_dst");
    setup(&h, src, dst).await;

    let copier = table_copier(&h, src, Destination::new(dst, h.target_provider.clone()));
    copier.droppy().await.unwrap();

    h.target
        .batch_execute(&format!(
            r#"
            ALTER TABLE "{dst}" ADD COLUMN legacy INTEGER;
            CREATE VIEW ts_views_ok AS SELECT id, name FROM "{dst}";
            CREATE VIEW ts_views_bad AS SELECT id, legacy FROM "{dst}";
            "#
        ))
        .await
        .unwrap();

    let report = copier.droppy().await.unwrap();
    assert_eq!(report.views.get("ts_views_ok"), Some(&true));
    assert_eq!(report.views.get("ts_views_bad"), Some(&false));

    let rows = h
        .target
        .query("SELECT count(*) FROM ts_views_ok", &[])
        .await
        .unwrap();
    assert_eq!(rows[0].get::<_, i64>(0), 3);

    let _ = h.target.batch_execute("DROP VIEW IF EXISTS ts_views_ok").await;
    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_query_source_with_duplicate_field_fails() {
    let h = harness().await;
    let (src, dst) = ("ts_dup_src", "ts_dup_dst");
    setup(&h, src, dst).await;

    let query = format!(r#"SELECT a.id, b.id FROM "{src}" a JOIN "{src}" b ON a.id = b.id"#);
    let copier = Copier::new(
        Source::query(query, h.source_provider.clone()),
        Destination::new(dst, h.target_provider.clone()),
    );

    match copier.update().await {
        Err(SyncError::DuplicateField(name)) => assert_eq!(name, "id"),
        other => panic!("expected duplicate field error, got {:?}", other.map(|r| r.strategy)),
    }

    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_query_source_always_rebuilds() {
    let h = harness().await;
    let (src, dst) = ("ts_query_src", "ts_query_dst");
    setup(&h, src, dst).await;

    let query = format!(r#"SELECT id, name FROM "{src}" WHERE id > 1"#);
    let copier = Copier::new(
        Source::query(query, h.source_provider.clone()),
        Destination::new(dst, h.target_provider.clone()),
    );

    let first = copier.update().await.unwrap();
    assert_eq!(first.strategy, Strategy::Droppy);
    assert_eq!(first.rows_moved, 2);

    let second = copier.update().await.unwrap();
    assert_eq!(second.strategy, Strategy::Droppy);
    assert_eq!(ids(&h.target, dst).await, vec![2, 3]);

    assert!(matches!(
        copier.diffy().await,
        Err(SyncError::InvalidOperation(_))
    ));
    assert!(matches!(
        copier.find_deletes().await,
        Err(SyncError::InvalidOperation(_))
    ));

    cleanup(&h, src, dst).await;
}

/// Source and destination on one physical connection use set-based SQL
/// instead of the COPY relay.
#[tokio::test]
#[ignore]
async fn test_shared_connection_uses_set_based_transfer() {
    let h = harness().await;
    let (src, dst) = ("ts_shared_src", "ts_shared_dst");
    setup(&h, src, dst).await;
    h.source
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{dst}" CASCADE"#))
        .await
        .unwrap();

    let shared = h.source_provider.clone();
    let copier = Copier::new(
        Source::table(src, shared.clone()),
        Destination::new(dst, shared).with_soft_delete_field("deleted"),
    );

    let report = copier.update().await.unwrap();
    assert_eq!(report.strategy, Strategy::Droppy);
    assert_eq!(report.rows_moved, 3);

    let not_deleted: i64 = h
        .source
        .query_one(&format!(r#"SELECT count(*) FROM "{dst}" WHERE NOT deleted"#), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(not_deleted, 3);

    h.source
        .batch_execute(&format!(
            r#"
            DELETE FROM "{src}" WHERE id = 1;
            INSERT INTO "{src}" VALUES (4, 'four', '2024-01-04');
            "#
        ))
        .await
        .unwrap();

    let report = copier.diffy().await.unwrap();
    assert_eq!(report.rows_moved, 3);
    assert_eq!(report.rows_deleted_or_flagged, 1);
    assert_eq!(ids(&h.source, dst).await, vec![1, 2, 3, 4]);

    let _ = h
        .source
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{dst}" CASCADE"#))
        .await;
    cleanup(&h, src, dst).await;
}

#[tokio::test]
#[ignore]
async fn test_source_schema_introspection() {
    let h = harness().await;
    h.source
        .batch_execute(
            r#"
            DROP TABLE IF EXISTS ts_schema_src;
            CREATE TABLE ts_schema_src (
                column1 INTEGER,
                column2 VARCHAR(123),
                column3 VARCHAR[]
            );
            CREATE INDEX ts_schema_src_multi ON ts_schema_src (column2, column1);
            "#,
        )
        .await
        .unwrap();

    let source = Source::Table(
        TableSource::new("ts_schema_src", h.source_provider.clone())
            .with_primary_key_inference(Arc::new(|table: &str| format!("{}_id", table))),
    );

    assert_eq!(
        source.fields_ddl().await.unwrap(),
        "\"column1\" integer,\n  \"column2\" character varying(123),\n  \"column3\" character varying(256)[]"
    );
    assert_eq!(
        source.primary_key().await.unwrap().as_deref(),
        Some("ts_schema_src_id")
    );

    let indexes = source.indexes().await.unwrap();
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].columns, vec!["column2", "column1"]);

    let plain = Source::table("ts_schema_src", h.source_provider.clone());
    assert_eq!(plain.primary_key().await.unwrap().as_deref(), Some("id"));

    let _ = h.source.batch_execute("DROP TABLE IF EXISTS ts_schema_src").await;
}

#[tokio::test]
#[ignore]
async fn test_query_fields_keep_type_modifiers() {
    let h = harness().await;
    let (src, dst) = ("ts_qfields_src", "ts_qfields_dst");
    setup(&h, src, dst).await;

    let source = Source::query(
        format!(r#"SELECT id, name, updated_at FROM "{src}""#),
        h.source_provider.clone(),
    );
    assert_eq!(
        source.fields_ddl().await.unwrap(),
        "\"id\" integer,\n  \"name\" character varying(20),\n  \"updated_at\" timestamp without time zone"
    );
    assert_eq!(source.primary_key().await.unwrap(), None);
    assert!(source.indexes().await.unwrap().is_empty());

    let computed = Source::query(
        format!(
            r#"SELECT id, name::varchar(10) AS short_name, (id * 1.5)::numeric(8, 2) AS score FROM "{src}""#
        ),
        h.source_provider.clone(),
    );
    assert_eq!(
        computed.fields_ddl().await.unwrap(),
        "\"id\" integer,\n  \"short_name\" character varying(10),\n  \"score\" numeric(8,2)"
    );

    cleanup(&h, src, dst).await;
}
