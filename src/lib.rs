//! Session-isolated database handles over a transaction-aware prepared
//! statement cache.
//!
//! A [`Db`] is opened once per database through a [`Dialector`] and then
//! derived freely: [`Db::session`] for overrides, [`Db::with_context`] for
//! cancellation, [`Db::begin`] / [`Db::transaction`] for transactions. With
//! `prepare_stmt` enabled every call goes through a shared
//! [`StatementStore`], which compiles each template once per scope.

pub mod clause;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pool;
pub mod prelude;
pub mod prepared;
pub mod results;
pub mod session;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod stmt_store;
pub mod test_utils;
pub mod types;

pub use config::{Config, ConfigBuilder};
pub use db::{Db, Dialector, Plugin};
pub use error::SessionDbError;
pub use stmt_store::StatementStore;
