use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::SessionDbError;
use crate::pool::ConnPool;
use crate::types::RowValues;

/// Backend entry point: opens the raw pool and knows the dialect's text rules.
#[async_trait]
pub trait Dialector: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Open the raw connection pool.
    async fn connect(&self, config: &Config) -> Result<Arc<dyn ConnPool>, SessionDbError>;

    /// Render `sql` with `vars` inlined, for logs and dry runs.
    fn explain(&self, sql: &str, vars: &[RowValues]) -> String {
        explain_positional(sql, vars)
    }

    fn savepoint(&self, name: &str) -> String {
        format!("SAVEPOINT {name}")
    }

    fn release_savepoint(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {name}")
    }

    fn rollback_to(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {name}")
    }

    fn as_error_translator(&self) -> Option<&dyn ErrorTranslator> {
        None
    }
}

/// Maps driver errors onto crate-level ones when `translate_error` is on.
pub trait ErrorTranslator: Send + Sync {
    fn translate(&self, err: SessionDbError) -> SessionDbError;
}

/// Replace each `?` outside string literals with the next value's literal.
#[must_use]
pub fn explain_positional(sql: &str, vars: &[RowValues]) -> String {
    let mut out = String::with_capacity(sql.len() + vars.len() * 8);
    let mut vars = vars.iter();
    let mut in_string = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '?' if !in_string => match vars.next() {
                Some(value) => out.push_str(&value.to_sql_literal()),
                None => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explain_skips_quoted_marks() {
        let sql = explain_positional(
            "SELECT '?' FROM t WHERE a = ? AND b = ? AND c = ?",
            &[1_i64.into(), "x'y".into()],
        );
        assert_eq!(sql, "SELECT '?' FROM t WHERE a = 1 AND b = 'x''y' AND c = ?");
    }
}
