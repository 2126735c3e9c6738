mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sql_session::pool::QueryContext;
use sql_session::stmt_store::DEFAULT_STMT_TTL;
use sql_session::test_utils::MockPool;
use sql_session::{SessionDbError, StatementStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_first_use_compiles_once() -> Result<(), SessionDbError> {
    common::init_tracing();
    let mock = MockPool::new().with_prepare_delay(Duration::from_millis(25));
    let store = Arc::new(StatementStore::new(0, DEFAULT_STMT_TTL));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let store = Arc::clone(&store);
        let mock = mock.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = QueryContext::new();
            store
                .get_or_compile(&ctx, "SELECT * FROM users WHERE id = ?", &mock, false)
                .await
                .map(|stmt| stmt.id())
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.expect("task panicked")?);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(mock.counts().prepares, 1);
    let stats = store.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 31);
    assert_eq!(stats.compiles, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_store_holds_under_concurrent_churn() -> Result<(), SessionDbError> {
    let mock = MockPool::new();
    let store = Arc::new(StatementStore::new(8, DEFAULT_STMT_TTL));

    let mut tasks = Vec::new();
    for worker in 0..8_usize {
        let store = Arc::clone(&store);
        let mock = mock.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = QueryContext::new();
            for i in 0..50_usize {
                let template = format!("SELECT {} FROM t", (worker * 7 + i) % 24);
                store
                    .get_or_compile(&ctx, &template, &mock, i % 5 == 0)
                    .await?;
            }
            Ok::<(), SessionDbError>(())
        }));
    }
    for task in tasks {
        task.await.expect("task panicked")?;
    }

    let stats = store.stats();
    assert!(stats.len <= 8, "store grew to {}", stats.len);
    assert_eq!(stats.hits + stats.misses, 400);
    assert_eq!(stats.compiles, stats.misses);
    assert_eq!(usize::try_from(stats.compiles).unwrap_or(usize::MAX), mock.counts().prepares);
    Ok(())
}

#[tokio::test]
async fn transaction_scope_never_touches_pool_entry() -> Result<(), SessionDbError> {
    let mock = MockPool::new();
    let store = StatementStore::new(0, DEFAULT_STMT_TTL);
    let ctx = QueryContext::new();
    let template = "UPDATE accounts SET balance = ? WHERE id = ?";

    let pooled = store.get_or_compile(&ctx, template, &mock, false).await?;
    let in_tx = store.get_or_compile(&ctx, template, &mock, true).await?;
    let in_tx_again = store.get_or_compile(&ctx, template, &mock, true).await?;

    assert_ne!(pooled.id(), in_tx.id());
    assert_eq!(in_tx.id(), in_tx_again.id());
    assert!(!pooled.is_closed());
    assert!(store.contains(template, false));
    assert!(store.contains(template, true));
    assert_eq!(mock.counts().prepares, 2);
    Ok(())
}

#[tokio::test]
async fn compile_error_is_remembered_until_evicted() {
    let mock = MockPool::new();
    let store = StatementStore::new(0, DEFAULT_STMT_TTL);
    let ctx = QueryContext::new();
    let template = "SELECT INVALID FROM";

    for _ in 0..3 {
        let err = store
            .get_or_compile(&ctx, template, &mock, false)
            .await
            .expect_err("template should not compile");
        assert!(matches!(err, SessionDbError::Prepare { .. }));
        assert!(err.to_string().contains(template));
    }
    assert_eq!(mock.counts().prepares, 1);

    store.evict(template);
    assert!(store.get_or_compile(&ctx, template, &mock, false).await.is_err());
    assert_eq!(mock.counts().prepares, 2);
}

#[tokio::test]
async fn ttl_counts_from_insertion() -> Result<(), SessionDbError> {
    let mock = MockPool::new();
    let store = StatementStore::new(0, Duration::from_millis(60));
    let ctx = QueryContext::new();

    let first = store.get_or_compile(&ctx, "SELECT 1", &mock, false).await?;
    // hits do not refresh the deadline
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.get_or_compile(&ctx, "SELECT 1", &mock, false).await?;
    }
    let later = store.get_or_compile(&ctx, "SELECT 1", &mock, false).await?;

    assert_ne!(first.id(), later.id());
    assert!(first.is_closed());
    assert_eq!(mock.counts().closes, 1);
    Ok(())
}

#[tokio::test]
async fn close_all_releases_every_handle() -> Result<(), SessionDbError> {
    let mock = MockPool::new();
    let store = StatementStore::new(0, DEFAULT_STMT_TTL);
    let ctx = QueryContext::new();

    for i in 0..5 {
        store
            .get_or_compile(&ctx, &format!("SELECT {i}"), &mock, i % 2 == 0)
            .await?;
    }
    store.close_all();

    assert!(store.is_empty());
    assert_eq!(mock.counts().closes, 5);
    assert_eq!(store.stats().evictions, 5);
    Ok(())
}
