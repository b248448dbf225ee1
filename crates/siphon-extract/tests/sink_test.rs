//! Tests for siphon-extract destination sinks driven by the engine

mod common;

use common::{fast_retry, FakeDb};
use siphon_extract::{
    DescriptorOutcome, DispatchEngine, OutputTarget, SourceDescriptor, SqlFileSink, TableSink,
};
use std::sync::Arc;

// ==================== Table Sink Tests ====================

#[tokio::test]
async fn test_table_sink_inserts_each_batch_in_a_transaction() {
    let db = FakeDb::new()
        .with_table("public", "orders", 250)
        .with_table("archive", "orders", 0);
    let sink = Arc::new(TableSink::new(db.pool().await));
    let d = SourceDescriptor::table("public", "orders")
        .with_batch_size(100)
        .with_id("orders");
    let d = SourceDescriptor {
        output: OutputTarget::new("archive", "orders"),
        ..d
    };

    let report = DispatchEngine::new(db.pool().await, sink)
        .with_retry(fast_retry())
        .run(vec![d])
        .await
        .unwrap();

    assert_eq!(report.get("orders").unwrap().outcome, DescriptorOutcome::Completed);

    let writes: Vec<String> = db
        .statements()
        .into_iter()
        .filter(|s| s == "BEGIN" || s == "COMMIT" || s.starts_with("INSERT"))
        .collect();
    assert_eq!(writes.len(), 9);
    assert_eq!(writes[0], "BEGIN");
    assert!(writes[1].starts_with("INSERT INTO \"archive\".\"orders\" (\"id\", \"name\") VALUES ($1, $2)"));
    assert!(writes[1].contains("$200"));
    assert_eq!(writes[2], "COMMIT");
    assert!(writes[7].contains("$100") && !writes[7].contains("$101"));
    assert!(!db.statements().iter().any(|s| s.starts_with("TRUNCATE")));
}

#[tokio::test]
async fn test_table_sink_truncates_on_open() {
    let db = FakeDb::new()
        .with_table("public", "t", 10)
        .with_table("public", "t_copy", 0);
    let sink = Arc::new(TableSink::new(db.pool().await).with_truncate(true));
    let d = SourceDescriptor::table("public", "t");
    let d = SourceDescriptor {
        output: OutputTarget::new("public", "t_copy"),
        ..d
    };

    DispatchEngine::new(db.pool().await, sink)
        .with_retry(fast_retry())
        .run(vec![d])
        .await
        .unwrap();

    let statements = db.statements();
    let truncate = statements
        .iter()
        .position(|s| s.starts_with("TRUNCATE") && s.contains("\"public\".\"t_copy\""))
        .expect("truncate issued");
    let first_insert = statements
        .iter()
        .position(|s| s.starts_with("INSERT"))
        .expect("insert issued");
    assert!(truncate < first_insert);
}

#[tokio::test]
async fn test_table_sink_missing_target_fails_without_fetching() {
    let db = FakeDb::new().with_table("public", "t", 10);
    let sink = Arc::new(TableSink::new(db.pool().await));
    let d = SourceDescriptor::table("public", "t");
    let d = SourceDescriptor {
        output: OutputTarget::new("archive", "missing"),
        ..d
    };

    let report = DispatchEngine::new(db.pool().await, sink)
        .with_retry(fast_retry())
        .run(vec![d])
        .await
        .unwrap();

    let r = report.get("public.t").unwrap();
    assert_eq!(r.outcome, DescriptorOutcome::Failed);
    assert_eq!(r.error_kind.as_deref(), Some("sink"));
    assert!(r.error.as_deref().unwrap_or("").contains("archive.missing"));
    assert_eq!(db.page_queries("public", "t"), 0);
}

// ==================== SQL File Sink Tests ====================

#[tokio::test]
async fn test_sql_file_sink_writes_replayable_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = FakeDb::new().with_table("public", "users", 25);
    let sink = Arc::new(SqlFileSink::new(dir.path()).await.unwrap());

    let report = DispatchEngine::new(db.pool().await, sink)
        .with_retry(fast_retry())
        .run(vec![SourceDescriptor::table("public", "users").with_batch_size(10)])
        .await
        .unwrap();
    assert_eq!(report.get("public.users").unwrap().rows, 25);

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("public_users_") && name.ends_with(".sql"));

    let content = std::fs::read_to_string(&files[0]).unwrap();
    assert!(content.starts_with("-- Backup of \"public\".\"users\""));
    assert!(content.contains("TRUNCATE TABLE \"public\".\"users\";"));
    assert_eq!(content.matches("INSERT INTO \"public\".\"users\"").count(), 25);
    assert!(content.contains("VALUES (25, 'row-25');"));
    assert!(content.trim_end().ends_with("SET session_replication_role = 'origin';"));
}

#[tokio::test]
async fn test_sql_file_sink_custom_query_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = FakeDb::new().with_table("public", "orders", 5);
    let sink = Arc::new(SqlFileSink::new(dir.path()).await.unwrap());
    let d = SourceDescriptor::custom_query(
        "SELECT *\nFROM \"public\".\"orders\"",
        OutputTarget::new("reports", "recent_orders"),
    );

    DispatchEngine::new(db.pool().await, sink)
        .with_retry(fast_retry())
        .run(vec![d])
        .await
        .unwrap();

    let path = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("reports_recent_orders_") && name.ends_with("_custom_query.sql"));

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("-- Original Query: SELECT *\n-- FROM \"public\".\"orders\""));
    assert_eq!(content.matches("INSERT INTO \"reports\".\"recent_orders\"").count(), 5);
}
