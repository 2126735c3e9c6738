mod common;

use std::error::Error;
use std::sync::Arc;

use chrono::NaiveDate;
use sql_session::clause::{Expr, Named, Select};
use sql_session::logging::SqlLogLevel;
use sql_session::pool::QueryContext;
use sql_session::session::{DeriveFlags, Generation};
use sql_session::types::RowValues;
use sql_session::{Config, SessionDbError};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn generations_follow_the_derivation_rules() -> Result<(), SessionDbError> {
    let (db, _mock) = common::open_mock(Config::default()).await?;
    assert_eq!(db.generation(), Generation::Root);

    let op = db.instance();
    assert_eq!(op.generation(), Generation::IsolatedClone);
    assert!(!op.shares_statement_with(&db));

    let shared = op.session(DeriveFlags::default());
    assert_eq!(shared.generation(), Generation::SharedClone);
    assert!(shared.shares_statement_with(&op));

    let copied = shared.session(DeriveFlags::isolated());
    assert_eq!(copied.generation(), Generation::IsolatedClone);
    assert!(!copied.shares_statement_with(&shared));

    let reset = shared.session(DeriveFlags {
        new_db: true,
        ..DeriveFlags::default()
    });
    assert_eq!(reset.generation(), Generation::Root);
    // a root hands out fresh request objects again
    assert!(!reset.instance().shares_statement_with(&reset));
    Ok(())
}

#[tokio::test]
async fn settings_stay_on_their_request_object() -> Result<(), SessionDbError> {
    let (db, _mock) = common::open_mock(Config::default()).await?;

    let op = db.set("tenant", 7_i64);
    assert_eq!(op.get::<i64>("tenant").as_deref(), Some(&7));
    assert!(db.get::<i64>("tenant").is_none());
    // wrong type is just absent
    assert!(op.get::<String>("tenant").is_none());

    let shared = op.session(DeriveFlags::default());
    let shared = shared.set("locale", "en".to_string());
    assert_eq!(op.get::<String>("locale").as_deref().map(String::as_str), Some("en"));

    let copied = op.session(DeriveFlags::isolated());
    assert_eq!(copied.get::<i64>("tenant").as_deref(), Some(&7));
    let copied = copied.set("tenant", 9_i64);
    assert_eq!(copied.get::<i64>("tenant").as_deref(), Some(&9));
    assert_eq!(op.get::<i64>("tenant").as_deref(), Some(&7));
    assert_eq!(shared.get::<i64>("tenant").as_deref(), Some(&7));
    Ok(())
}

#[tokio::test]
async fn instance_settings_do_not_follow_copies() -> Result<(), SessionDbError> {
    let (db, _mock) = common::open_mock(Config::default()).await?;

    let op = db.instance_set("started", 1_u32);
    assert_eq!(op.instance_get::<u32>("started").as_deref(), Some(&1));
    assert!(op.get::<u32>("started").is_none());

    let shared = op.session(DeriveFlags::default());
    assert_eq!(shared.instance_get::<u32>("started").as_deref(), Some(&1));

    let copied = op.session(DeriveFlags::isolated());
    assert!(copied.instance_get::<u32>("started").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_do_not_see_each_other() -> Result<(), Box<dyn Error>> {
    let (db, mock) = common::open_mock(Config::default()).await?;

    let mut tasks = Vec::new();
    for worker in 0..16_i64 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            let op = db.set("worker", worker);
            tokio::task::yield_now().await;
            let done = op
                .exec("UPDATE jobs SET owner = ? WHERE id = ?", &[worker.into(), worker.into()])
                .await;
            done.result()?;
            let seen = done.get::<i64>("worker").map(|v| *v);
            Ok::<_, Arc<SessionDbError>>((worker, seen))
        }));
    }

    for task in tasks {
        let (worker, seen) = task.await??;
        assert_eq!(seen, Some(worker));
    }
    assert!(db.get::<i64>("worker").is_none());
    assert_eq!(mock.counts().executes, 16);
    assert_eq!(mock.executed().len(), 16);
    Ok(())
}

#[tokio::test]
async fn scalar_overrides_do_not_leak_to_parent() -> Result<(), SessionDbError> {
    let (db, _mock) = common::open_mock(Config::default()).await?;
    let fixed = NaiveDate::from_ymd_opt(2024, 1, 2)
        .and_then(|d| d.and_hms_opt(3, 4, 5))
        .expect("valid date");

    let derived = db.session(DeriveFlags {
        skip_default_transaction: true,
        create_batch_size: 50,
        now_fn: Some(Arc::new(move || fixed)),
        ..DeriveFlags::default()
    });
    assert!(derived.config().skip_default_transaction);
    assert_eq!(derived.config().create_batch_size, 50);
    assert_eq!(derived.now(), fixed);
    assert!(!db.config().skip_default_transaction);
    assert_eq!(db.config().create_batch_size, 0);

    let debug = db.debug();
    assert_eq!(debug.config().sql_log, SqlLogLevel::Info);
    assert_eq!(db.config().sql_log, SqlLogLevel::Silent);
    Ok(())
}

#[tokio::test]
async fn cancelled_context_stops_dispatch() -> Result<(), Arc<SessionDbError>> {
    let (db, mock) = common::open_mock(Config::default()).await?;
    let token = CancellationToken::new();
    let scoped = db.with_context(QueryContext::with_cancellation(token.clone()));

    scoped.exec("DELETE FROM sessions", &[]).await.result()?;
    token.cancel();
    let cancelled = scoped.exec("DELETE FROM sessions", &[]).await;

    assert!(matches!(cancelled.error(), Some(SessionDbError::Cancelled)));
    assert_eq!(mock.counts().executes, 1);
    // the root's own context is untouched
    db.exec("DELETE FROM sessions", &[]).await.result()?;
    Ok(())
}

#[tokio::test]
async fn errors_accumulate_and_stop_dispatch() -> Result<(), SessionDbError> {
    let (db, mock) = common::open_mock(Config::default()).await?;

    mock.fail_next(1);
    let failed = db.exec("UPDATE a SET x = 1", &[]).await;
    assert!(failed.error().is_some());

    let skipped = failed.exec("UPDATE b SET x = 1", &[]).await;
    assert!(skipped.error().is_some());
    assert_eq!(mock.counts().executes, 1);
    assert!(mock.executed().is_empty());

    // derived handles inherit the error
    assert!(failed.session(DeriveFlags::isolated()).result().is_err());

    let mut op = db.instance();
    op.add_error(SessionDbError::ConnectionError("first".into()));
    let err = op.add_error(SessionDbError::ExecutionError("second".into()));
    assert_eq!(
        err.to_string(),
        "Connection error: first; SQL execution error: second"
    );
    assert!(matches!(err.latest(), SessionDbError::ExecutionError(msg) if msg == "second"));
    assert!(db.error().is_none());
    Ok(())
}

#[tokio::test]
async fn dry_run_and_to_sql_render_without_dispatch() -> Result<(), Arc<SessionDbError>> {
    let (db, mock) = common::open_mock(Config::default()).await?;

    let dry = db.session(DeriveFlags {
        dry_run: true,
        ..DeriveFlags::default()
    });
    let staged = dry.exec("DELETE FROM users WHERE id = ?", &[4_i64.into()]).await;
    staged.result()?;
    {
        let stmt = staged.statement().lock().expect("statement lock");
        assert_eq!(stmt.sql, "DELETE FROM users WHERE id = ?");
        assert_eq!(stmt.vars, vec![RowValues::Int(4)]);
    }

    let sql = db
        .to_sql(|tx| async move {
            tx.exec(
                "UPDATE users SET name = ? WHERE id = ?",
                &["o'neil".into(), 3_i64.into()],
            )
            .await
        })
        .await;
    assert_eq!(sql, "UPDATE users SET name = 'o''neil' WHERE id = 3");
    assert_eq!(mock.counts().executes, 0);
    Ok(())
}

#[tokio::test]
async fn clauses_build_the_query_when_no_sql_is_staged() -> Result<(), Box<dyn Error>> {
    let (db, mock) = common::open_mock(Config::default()).await?;

    let mut query = db
        .add_clause(Select::columns(["id", "name"]))
        .add_clause(Named::new("FROM", Expr::new("users", vec![])))
        .add_clause(Named::new("WHERE", Expr::new("id = ?", vec![5_i64.into()])));
    let row = query.row().await?.expect("mock returns one row");

    let expected = r#"SELECT "id","name" FROM users WHERE id = ?"#;
    assert_eq!(row.get("sql").and_then(RowValues::as_text), Some(expected));
    assert_eq!(row.get("params").and_then(RowValues::as_int), Some(&1));
    assert_eq!(mock.executed(), vec![format!("{expected} [5]")]);

    let mut empty = db.instance();
    assert!(empty.rows().await.is_err());
    Ok(())
}
