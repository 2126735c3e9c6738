//! Prepare-mode wrappers: every call is routed through the shared
//! [`StatementStore`](crate::stmt_store::StatementStore).

mod pool;
mod tx;

pub use pool::PreparedPool;
pub use tx::PreparedTx;

use std::sync::Arc;

use tracing::warn;

use crate::error::SessionDbError;
use crate::stmt_store::{CompiledStatement, StatementStore};

/// Drop `stmt` from the cache when the driver reports a dead connection,
/// then hand the error back unchanged.
///
/// Only the entry that failed is dropped; a replacement compiled meanwhile
/// by another caller stays cached.
fn evict_on_bad_conn<T>(
    store: &StatementStore,
    stmt: &Arc<CompiledStatement>,
    res: Result<T, SessionDbError>,
) -> Result<T, SessionDbError> {
    if let Err(err) = &res
        && err.is_bad_conn()
    {
        warn!(
            template = stmt.template(),
            id = stmt.id(),
            error = %err,
            "bad connection while executing cached statement"
        );
        store.evict_entry(stmt);
    }
    res
}

fn no_preparer() -> SessionDbError {
    SessionDbError::Unimplemented("connection pool cannot prepare statements".into())
}
