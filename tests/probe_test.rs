//! Integration tests for database capability probing.

use cms_db_core::db::{
    CapabilityProber, ConcatStyle, Connector, ContextId, DbProduct, Handle, HandleRegistry,
    LengthSemantics, LimitStyle, MetadataCache, QueryExecutor, TransactionManager,
};
use cms_db_core::{ConnectSpec, HandleConfig, PoolOptions, SqlParam};
use tempfile::TempDir;

fn setup(dir: &TempDir) -> (HandleRegistry, QueryExecutor, CapabilityProber, Handle) {
    let url = format!("sqlite://{}", dir.path().join("probe.sqlite").display());
    let spec = ConnectSpec::parse(url).unwrap();
    let registry = HandleRegistry::new(MetadataCache::new());
    let handle = registry
        .register(
            HandleConfig::new("online"),
            Connector::pooled(spec, &PoolOptions::default()),
        )
        .unwrap();
    let executor = QueryExecutor::new(TransactionManager::new(registry.clone()));
    let prober = CapabilityProber::new(executor.clone());
    (registry, executor, prober, handle)
}

#[tokio::test]
async fn test_probe_detects_sqlite_dialect() {
    let dir = tempfile::tempdir().unwrap();
    let (_registry, _executor, prober, handle) = setup(&dir);

    let caps = prober.ensure(&handle).await.unwrap();
    assert_eq!(caps.product, DbProduct::Sqlite);
    // SQLite accepts trailing LIMIT and a bare SELECT keep-alive.
    assert_eq!(caps.limit, LimitStyle::Trailing);
    assert_eq!(caps.keep_alive.as_deref(), Some("SELECT 1"));
    // Concatenation works through CONCAT() on newer SQLite and || always.
    assert!(matches!(
        caps.concat,
        Some(ConcatStyle::Function | ConcatStyle::PipesOperator)
    ));
    let cast = caps.text_cast.expect("text cast should be detected");
    assert!(!cast.truncate_before_cast);
    assert_eq!(caps.length_semantics, LengthSemantics::Utf16Units);
    assert!(!caps.folds_uppercase);
    assert!(caps.supports_batch);
}

#[tokio::test]
async fn test_probe_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _executor, prober, handle) = setup(&dir);

    assert!(registry.lookup(&handle).unwrap().capabilities().is_none());
    let first = prober.ensure(&handle).await.unwrap();
    assert!(registry.lookup(&handle).unwrap().capabilities().is_some());

    // The second call is a no-op returning the cached capabilities.
    let second = prober.ensure(&handle).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_concurrent_probes_are_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let (_registry, _executor, prober, handle) = setup(&dir);

    let a = {
        let prober = prober.clone();
        let handle = handle.clone();
        tokio::spawn(async move { prober.ensure(&handle).await.unwrap() })
    };
    let b = {
        let prober = prober.clone();
        let handle = handle.clone();
        tokio::spawn(async move { prober.ensure(&handle).await.unwrap() })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_probe_does_not_disturb_open_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (_registry, executor, prober, handle) = setup(&dir);
    let transactions = executor.transactions().clone();

    let ctx = ContextId::new();
    executor
        .update(
            &ctx,
            &handle,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)",
            &[],
        )
        .await
        .unwrap();

    transactions.begin(&ctx, &handle, false).await.unwrap();
    executor
        .update(
            &ctx,
            &handle,
            "INSERT INTO items (id, name) VALUES (?, ?)",
            &[SqlParam::Int(1), SqlParam::str("held")],
        )
        .await
        .unwrap();

    // The probe uses its own context; the caller's scope stays open and
    // its transaction intact.
    prober.ensure(&handle).await.unwrap();
    assert!(transactions.has_scope(&ctx, &handle));
    transactions.commit(&ctx, &handle, true).await.unwrap();

    let count = executor
        .query(&ctx, &handle, "SELECT COUNT(*) FROM items", &[], |rs| {
            assert!(rs.next());
            Ok(rs.get_long(0)?.unwrap())
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_probed_concat_style_is_usable() {
    let dir = tempfile::tempdir().unwrap();
    let (_registry, executor, prober, handle) = setup(&dir);

    let caps = prober.ensure(&handle).await.unwrap();
    let concat = caps.concat.expect("concat style should be detected");

    let ctx = ContextId::new();
    let sql = format!("SELECT {}", concat.expression("'cms_'", "'resources'"));
    let value = executor
        .query(&ctx, &handle, &sql, &[], |rs| {
            assert!(rs.next());
            Ok(rs.get_string(0)?.unwrap())
        })
        .await
        .unwrap();
    assert_eq!(value, "cms_resources");
}
