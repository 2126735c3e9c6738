#![allow(dead_code)]

use std::sync::Once;

use sql_session::test_utils::{MockDialector, MockPool};
use sql_session::{Config, Db, SessionDbError};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route crate logs to the test harness. Set `RUST_LOG=sql_session=debug` to see them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Open a root handle over a fresh counting mock.
pub async fn open_mock(config: Config) -> Result<(Db, MockPool), SessionDbError> {
    init_tracing();
    let mock = MockPool::new();
    let db = Db::open(MockDialector::new(mock.clone()), config).await?;
    Ok((db, mock))
}
