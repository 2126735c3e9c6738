use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::RowValues;

/// How loudly a handle reports the SQL it dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlLogLevel {
    #[default]
    Silent,
    Debug,
    Info,
}

/// Emit one trace event for a dispatched statement.
pub(crate) fn trace_sql(
    level: SqlLogLevel,
    sql: &str,
    vars: &[RowValues],
    elapsed: Duration,
    rows: Option<u64>,
    failed: bool,
) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    match level {
        SqlLogLevel::Silent => {}
        SqlLogLevel::Debug => debug!(
            target: "sql_session::sql",
            sql,
            vars = vars.len(),
            elapsed_ms,
            rows,
            failed
        ),
        SqlLogLevel::Info => info!(
            target: "sql_session::sql",
            sql,
            vars = vars.len(),
            elapsed_ms,
            rows,
            failed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parses_from_lowercase() {
        let level: SqlLogLevel = serde_json::from_str("\"info\"").unwrap();
        assert_eq!(level, SqlLogLevel::Info);
        assert_eq!(SqlLogLevel::default(), SqlLogLevel::Silent);
    }
}
