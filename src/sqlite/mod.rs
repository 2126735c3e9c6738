// SQLite backend
//
// - config: options, builder and the bb8 manager
// - params: conversion from `RowValues` to rusqlite values
// - query: result extraction
// - pool / transaction / prepared: the `ConnPool` capability implementations
// - dialector: entry point for `Db::open`

pub mod config;
mod dialector;
pub mod params;
mod pool;
mod prepared;
pub mod query;
mod transaction;

pub use config::{SharedSqliteConnection, SqliteManager, SqliteOptions, SqliteOptionsBuilder};
pub use dialector::SqliteDialector;
pub use pool::SqlitePool;
pub use prepared::SqlitePrepared;
pub use query::build_result_set;
pub use transaction::SqliteTx;
