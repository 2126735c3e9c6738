use std::sync::Arc;

use async_trait::async_trait;

use super::config::SqliteOptions;
use super::pool::SqlitePool;
use crate::config::Config;
use crate::db::{Dialector, ErrorTranslator};
use crate::error::SessionDbError;
use crate::pool::ConnPool;

/// Opens a bb8 `SQLite` pool for [`Db::open`](crate::db::Db::open).
#[derive(Debug, Clone)]
pub struct SqliteDialector {
    opts: SqliteOptions,
}

impl SqliteDialector {
    #[must_use]
    pub fn new(opts: SqliteOptions) -> Self {
        Self { opts }
    }

    #[must_use]
    pub fn open(db_path: impl Into<String>) -> Self {
        Self::new(SqliteOptions::new(db_path.into()))
    }

    #[must_use]
    pub fn memory() -> Self {
        Self::new(SqliteOptions::memory())
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.opts
    }
}

#[async_trait]
impl Dialector for SqliteDialector {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self, _config: &Config) -> Result<Arc<dyn ConnPool>, SessionDbError> {
        Ok(Arc::new(SqlitePool::connect(&self.opts).await?))
    }

    fn as_error_translator(&self) -> Option<&dyn ErrorTranslator> {
        Some(self)
    }
}

impl ErrorTranslator for SqliteDialector {
    fn translate(&self, err: SessionDbError) -> SessionDbError {
        let SessionDbError::SqliteError(rusqlite::Error::SqliteFailure(failure, _)) = &err else {
            return err;
        };
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                SessionDbError::DuplicatedKey
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => SessionDbError::ForeignKeyViolated,
            rusqlite::ffi::SQLITE_CONSTRAINT_CHECK => SessionDbError::CheckConstraintViolated,
            _ => err,
        }
    }
}
