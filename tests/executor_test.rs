//! Integration tests for query and update execution.

use cms_db_core::db::{
    Connector, ContextId, Handle, HandleRegistry, MetadataCache, QueryExecutor, SqlType,
    TransactionManager,
};
use cms_db_core::{ConnectSpec, ExecOptions, HandleConfig, PoolOptions, SqlParam};
use tempfile::TempDir;

fn setup(dir: &TempDir, config: HandleConfig) -> (QueryExecutor, Handle) {
    let url = format!("sqlite://{}", dir.path().join("cms.sqlite").display());
    let spec = ConnectSpec::parse(url).unwrap();
    let registry = HandleRegistry::new(MetadataCache::new());
    let handle = registry
        .register(config, Connector::pooled(spec, &PoolOptions::default()))
        .unwrap();
    let executor = QueryExecutor::new(TransactionManager::new(registry));
    (executor, handle)
}

async fn create_resources(executor: &QueryExecutor, handle: &Handle) {
    let ctx = ContextId::new();
    executor
        .update(
            &ctx,
            handle,
            "CREATE TABLE IF NOT EXISTS resources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                size INTEGER,
                score REAL,
                published INTEGER,
                content BLOB
            )",
            &[],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_query_typed_column_reads() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    let rows = executor
        .update(
            &ctx,
            &handle,
            "INSERT INTO resources (path, size, score, published, content) VALUES (?, ?, ?, ?, ?)",
            &[
                SqlParam::str("/sites/default/index.html"),
                SqlParam::Int(2048),
                SqlParam::Float(0.5),
                SqlParam::Bool(true),
                SqlParam::Bytes(vec![0xDE, 0xAD]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(rows, 1);

    executor
        .query(
            &ctx,
            &handle,
            "SELECT path, size, score, published, content FROM resources WHERE path = ?",
            &[SqlParam::str("/sites/default/index.html")],
            |rs| {
                assert_eq!(rs.len(), 1);
                assert_eq!(
                    rs.columns(),
                    vec!["path", "size", "score", "published", "content"]
                );
                assert!(rs.next());
                assert_eq!(
                    rs.get_string("path")?.as_deref(),
                    Some("/sites/default/index.html")
                );
                assert_eq!(rs.get_int("size")?, Some(2048));
                assert_eq!(rs.get_long(1)?, Some(2048));
                assert_eq!(rs.get_double("score")?, Some(0.5));
                assert_eq!(rs.get_bool("published")?, Some(true));
                assert_eq!(rs.row()?.bytes("content")?, Some(vec![0xDE, 0xAD]));
                assert!(!rs.next());
                Ok(())
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_typed_null_binding() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    executor
        .update(
            &ctx,
            &handle,
            "INSERT INTO resources (path, size, content) VALUES (?, ?, ?)",
            &[
                SqlParam::str("/empty"),
                SqlParam::Null(Some(SqlType::Int)),
                SqlParam::Null(None),
            ],
        )
        .await
        .unwrap();

    executor
        .query(
            &ctx,
            &handle,
            "SELECT size, content FROM resources WHERE path = ?",
            &[SqlParam::str("/empty")],
            |rs| {
                assert!(rs.next());
                assert_eq!(rs.get_int("size")?, None);
                assert_eq!(rs.get_string("content")?, None);
                Ok(())
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_query_callback_error_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    let err = executor
        .query(&ctx, &handle, "SELECT 1", &[], |rs| {
            assert!(rs.next());
            Err::<(), _>(cms_db_core::DbError::statement("caller rejected the row"))
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("caller rejected"));
    assert_eq!(executor.transactions().open_scopes(), 0);
}

#[tokio::test]
async fn test_update_returns_affected_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    for i in 0..3 {
        executor
            .update(
                &ctx,
                &handle,
                "INSERT INTO resources (path, size) VALUES (?, ?)",
                &[SqlParam::str(format!("/r{i}")), SqlParam::Int(i)],
            )
            .await
            .unwrap();
    }
    let affected = executor
        .update(
            &ctx,
            &handle,
            "UPDATE resources SET size = size + 1 WHERE size >= ?",
            &[SqlParam::Int(0)],
        )
        .await
        .unwrap();
    assert_eq!(affected, 3);
}

#[tokio::test]
async fn test_generated_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    let opts = ExecOptions {
        generated_keys: Some(vec!["id".to_string()]),
        ..Default::default()
    };
    let first = executor
        .update_opts(
            &ctx,
            &handle,
            "INSERT INTO resources (path) VALUES (?)",
            &[SqlParam::str("/a")],
            &opts,
        )
        .await
        .unwrap();
    assert_eq!(first.rows_affected, 1);
    let key = &first.generated_keys[0]["id"];
    assert_eq!(key.as_i64(), Some(1));

    let second = executor
        .update_opts(
            &ctx,
            &handle,
            "INSERT INTO resources (path) VALUES (?)",
            &[SqlParam::str("/b")],
            &opts,
        )
        .await
        .unwrap();
    assert_eq!(second.generated_keys[0]["id"].as_i64(), Some(2));
}

#[tokio::test]
async fn test_generated_keys_uppercased_when_folding() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HandleConfig::new("online");
    config.uppercase_identifiers = Some(true);
    let (executor, handle) = setup(&dir, config);
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    let opts = ExecOptions {
        generated_keys: Some(vec!["id".to_string()]),
        ..Default::default()
    };
    let outcome = executor
        .update_opts(
            &ctx,
            &handle,
            "INSERT INTO resources (path) VALUES (?)",
            &[SqlParam::str("/a")],
            &opts,
        )
        .await
        .unwrap();
    assert!(outcome.generated_keys[0].contains_key("ID"));
}

#[tokio::test]
async fn test_batch_update_matches_sequential_updates() {
    let dir = tempfile::tempdir().unwrap();

    // One handle with batching, one with the sequential fallback forced.
    let (batched, batched_handle) = setup(&dir, HandleConfig::new("batched"));
    create_resources(&batched, &batched_handle).await;

    let dir2 = tempfile::tempdir().unwrap();
    let mut config = HandleConfig::new("sequential");
    config.supports_batch = Some(false);
    let (sequential, sequential_handle) = setup(&dir2, config);
    create_resources(&sequential, &sequential_handle).await;

    let sql = "INSERT INTO resources (path, size) VALUES (?, ?)";
    let param_sets: Vec<Vec<SqlParam>> = (0..3)
        .map(|i| vec![SqlParam::str(format!("/r{i}")), SqlParam::Int(i)])
        .collect();

    let ctx = ContextId::new();
    let batched_total = batched
        .batch_update(&ctx, &batched_handle, sql, &param_sets)
        .await
        .unwrap();
    let sequential_total = sequential
        .batch_update(&ctx, &sequential_handle, sql, &param_sets)
        .await
        .unwrap();

    assert_eq!(batched_total, 3);
    assert_eq!(batched_total, sequential_total);

    for (executor, handle) in [(&batched, &batched_handle), (&sequential, &sequential_handle)] {
        let count = executor
            .query(&ctx, handle, "SELECT COUNT(*) FROM resources", &[], |rs| {
                assert!(rs.next());
                Ok(rs.get_long(0)?.unwrap())
            })
            .await
            .unwrap();
        assert_eq!(count, 3);
    }
}

#[tokio::test]
async fn test_batch_update_participates_in_open_scope() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let transactions = executor.transactions().clone();
    let ctx = ContextId::new();
    let sql = "INSERT INTO resources (path, size) VALUES (?, ?)";
    let param_sets: Vec<Vec<SqlParam>> = (0..3)
        .map(|i| vec![SqlParam::str(format!("/r{i}")), SqlParam::Int(i)])
        .collect();

    transactions.begin(&ctx, &handle, false).await.unwrap();
    executor
        .batch_update(&ctx, &handle, sql, &param_sets)
        .await
        .unwrap();
    transactions.rollback(&ctx, &handle, true).await.unwrap();

    let count = executor
        .query(&ctx, &handle, "SELECT COUNT(*) FROM resources", &[], |rs| {
            assert!(rs.next());
            Ok(rs.get_long(0)?.unwrap())
        })
        .await
        .unwrap();
    assert_eq!(count, 0, "batched inserts must follow the caller's rollback");
}

#[tokio::test]
async fn test_quiet_options_suppress_logging_not_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));

    let ctx = ContextId::new();
    let err = executor
        .query_opts(
            &ctx,
            &handle,
            "SELECT broken FROM nowhere",
            &[],
            &ExecOptions::quiet(),
            |_| Ok(()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, cms_db_core::DbError::StatementFailure { .. }));

    // The failure left nothing behind.
    assert_eq!(executor.transactions().open_scopes(), 0);
}

#[tokio::test]
async fn test_raw_value_reads() {
    let dir = tempfile::tempdir().unwrap();
    let (executor, handle) = setup(&dir, HandleConfig::new("online"));
    create_resources(&executor, &handle).await;

    let ctx = ContextId::new();
    executor
        .update(
            &ctx,
            &handle,
            "INSERT INTO resources (path, size) VALUES (?, ?)",
            &[SqlParam::str("/raw"), SqlParam::Int(7)],
        )
        .await
        .unwrap();

    executor
        .query(
            &ctx,
            &handle,
            "SELECT path, size FROM resources WHERE path = ?",
            &[SqlParam::str("/raw")],
            |rs| {
                assert!(rs.next());
                assert_eq!(rs.get_value(0)?, serde_json::json!("/raw"));
                assert_eq!(rs.get_value(1)?, serde_json::json!(7));
                Ok(())
            },
        )
        .await
        .unwrap();
}
