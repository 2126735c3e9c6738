//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::clause::{ClauseInterface, Column, Expr, Named, Select};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::db::{Db, Dialector, ErrorTranslator, Plugin};
pub use crate::error::SessionDbError;
pub use crate::logging::SqlLogLevel;
pub use crate::pool::{ConnPool, ConnTarget, QueryContext, TxOptions};
pub use crate::prepared::{PreparedPool, PreparedTx};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::session::{DeriveFlags, Generation};
pub use crate::stmt_store::StatementStore;
pub use crate::types::{ExecResult, RowValues};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteDialector, SqliteOptions, SqliteOptionsBuilder, SqlitePool};
