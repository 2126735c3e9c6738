use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sql_session::prelude::*;
use sql_session::stmt_store::{StoreStats, DEFAULT_STMT_TTL};
use sql_session::test_utils::{MockCounts, MockDialector, MockPool};

use crate::args::SimConfig;
use crate::model::{template, Op, Tally};

pub(crate) struct Report {
    pub(crate) counts: MockCounts,
    pub(crate) stats: Option<StoreStats>,
    pub(crate) tally: Arc<Tally>,
}

pub(crate) async fn run(config: &SimConfig) -> Result<Report, SessionDbError> {
    let mock = MockPool::new().with_prepare_delay(Duration::from_millis(config.prepare_delay_ms));
    let ttl = config
        .cache_ttl_ms
        .map_or(DEFAULT_STMT_TTL, Duration::from_millis);
    let db = Db::open(
        MockDialector::new(mock.clone()),
        Config::builder()
            .prepare_stmt(true)
            .prepare_stmt_max_size(config.cache_size)
            .prepare_stmt_ttl(ttl)
            .finish(),
    )
    .await?;

    let tally = Arc::new(Tally::default());
    let per_task = (config.iterations / config.tasks as u64).max(1);
    let mut handles = Vec::with_capacity(config.tasks);
    for task in 0..config.tasks {
        let db = db.clone();
        let mock = mock.clone();
        let tally = Arc::clone(&tally);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            run_task(task, per_task, &db, &mock, &config, &tally).await;
        }));
    }
    for handle in handles {
        handle.await?;
    }

    tracing::info!(
        ops = Tally::get(&tally.ops),
        errors = Tally::get(&tally.errors),
        "workload finished"
    );
    Ok(Report {
        counts: mock.counts(),
        stats: db.statement_cache().map(|store| store.stats()),
        tally,
    })
}

async fn run_task(
    task: usize,
    steps: u64,
    db: &Db,
    mock: &MockPool,
    config: &SimConfig,
    tally: &Tally,
) {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed ^ (task as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    for step in 0..steps {
        let op = next_op(config, &mut rng);
        Tally::bump(&tally.ops);
        let sql = template(rng.random_range(0..config.templates));
        let params = vec![RowValues::Int(step as i64), RowValues::Int(task as i64)];
        match op {
            Op::Exec => {
                if db.exec(&sql, &params).await.error().is_some() {
                    Tally::bump(&tally.errors);
                }
            }
            Op::Query => {
                if db.raw(&sql, &params).rows().await.is_err() {
                    Tally::bump(&tally.errors);
                }
            }
            Op::Transaction { fail } => {
                let res = db
                    .transaction(|tx| async move {
                        tx.exec(&sql, &params).await.result()?;
                        if fail {
                            return Err(Arc::new(SessionDbError::ExecutionError(
                                "simulated closure failure".into(),
                            )));
                        }
                        Ok(())
                    })
                    .await;
                match res {
                    Ok(()) => Tally::bump(&tally.commits),
                    Err(_) => Tally::bump(&tally.rollbacks),
                }
            }
            Op::Derive => check_isolation(db, task, step, tally),
            Op::BreakConn => mock.break_next(1),
            Op::FailNext => mock.fail_next(1),
            Op::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }
}

/// Copy-on-write handles must not leak settings into their parent, and
/// shared derivations must see each other's writes.
fn check_isolation(db: &Db, task: usize, step: u64, tally: &Tally) {
    let op = db.instance().set("owner", task);
    let isolated = op.session(DeriveFlags::isolated()).set("owner", usize::MAX);
    let shared = op.session(DeriveFlags::default()).set("step", step);

    let ok = op.get::<usize>("owner").as_deref() == Some(&task)
        && isolated.get::<usize>("owner").as_deref() == Some(&usize::MAX)
        && op.get::<u64>("step").as_deref() == Some(&step)
        && shared.shares_statement_with(&op)
        && !isolated.shares_statement_with(&op)
        && db.get::<usize>("owner").is_none();
    if !ok {
        tracing::error!(task, step, "isolation violated");
        Tally::bump(&tally.violations);
    }
}

fn next_op(config: &SimConfig, rng: &mut ChaCha8Rng) -> Op {
    let roll = rng.random::<f64>();
    let mut edge = config.sleep_rate;
    if roll < edge {
        return Op::Sleep(rng.random_range(1..=5));
    }
    edge += config.break_rate;
    if roll < edge {
        return Op::BreakConn;
    }
    edge += config.fail_rate;
    if roll < edge {
        return Op::FailNext;
    }
    edge += config.tx_rate;
    if roll < edge {
        return Op::Transaction {
            fail: rng.random::<f64>() < 0.2,
        };
    }
    edge += config.derive_rate;
    if roll < edge {
        return Op::Derive;
    }
    if rng.random::<bool>() { Op::Exec } else { Op::Query }
}
