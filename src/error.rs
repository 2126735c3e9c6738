use std::sync::Arc;

use thiserror::Error;

#[cfg(feature = "sqlite")]
use rusqlite;

#[derive(Debug, Error)]
pub enum SessionDbError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    /// The driver reported that the connection can no longer be used.
    #[error("bad connection: {0}")]
    BadConnection(String),

    /// Compiling a template failed; the failure is cached with the template.
    #[error("failed to prepare statement `{template}`: {source}")]
    Prepare {
        template: Arc<str>,
        #[source]
        source: Arc<SessionDbError>,
    },

    #[error("invalid transaction")]
    InvalidTransaction,

    #[error("plugin `{0}` is already registered")]
    PluginRegistered(String),

    #[error("plugin `{name}` failed to initialize: {source}")]
    PluginInit {
        name: String,
        #[source]
        source: Box<SessionDbError>,
    },

    #[error("duplicated key not allowed")]
    DuplicatedKey,

    #[error("violates foreign key constraint")]
    ForeignKeyViolated,

    #[error("violates check constraint")]
    CheckConstraintViolated,

    #[error("invalid db: no underlying pool is reachable from this handle")]
    InvalidDb,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Several failures recorded on one handle, oldest first.
    #[error("{previous}; {source}")]
    Accumulated {
        previous: String,
        #[source]
        source: Box<SessionDbError>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(String),

    #[error("Other database error: {0}")]
    Other(String),
}

impl SessionDbError {
    /// True for the broken-connection class that forces statement eviction.
    #[must_use]
    pub fn is_bad_conn(&self) -> bool {
        match self {
            SessionDbError::BadConnection(_) => true,
            #[cfg(feature = "sqlite")]
            SessionDbError::SqliteError(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::NotADatabase
            ),
            SessionDbError::Prepare { source, .. } => source.is_bad_conn(),
            _ => false,
        }
    }

    /// Walk an accumulated chain and return the most recent failure.
    #[must_use]
    pub fn latest(&self) -> &SessionDbError {
        match self {
            SessionDbError::Accumulated { source, .. } => source.latest(),
            other => other,
        }
    }

    pub(crate) fn prepare(template: &Arc<str>, source: SessionDbError) -> Self {
        match source {
            // already wrapped by a nested store
            SessionDbError::Prepare { .. } => source,
            other => SessionDbError::Prepare {
                template: Arc::clone(template),
                source: Arc::new(other),
            },
        }
    }

    /// Clone-able view of a cached compile failure.
    pub(crate) fn shared(err: &Arc<SessionDbError>, template: &Arc<str>) -> Self {
        let source = match err.as_ref() {
            SessionDbError::Prepare { source, .. } => Arc::clone(source),
            _ => Arc::clone(err),
        };
        SessionDbError::Prepare {
            template: Arc::clone(template),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for SessionDbError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionDbError::ExecutionError(format!("blocking task join error: {err}"))
    }
}

#[cfg(feature = "sqlite")]
impl From<bb8::RunError<SessionDbError>> for SessionDbError {
    fn from(err: bb8::RunError<SessionDbError>) -> Self {
        match err {
            bb8::RunError::User(inner) => inner,
            bb8::RunError::TimedOut => {
                SessionDbError::ConnectionError("SQLite pool checkout timed out".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulated_keeps_chain_and_latest() {
        let first = SessionDbError::ExecutionError("first".into());
        let err = SessionDbError::Accumulated {
            previous: first.to_string(),
            source: Box::new(SessionDbError::InvalidTransaction),
        };
        assert_eq!(
            err.to_string(),
            "SQL execution error: first; invalid transaction"
        );
        assert!(matches!(err.latest(), SessionDbError::InvalidTransaction));
    }

    #[test]
    fn bad_conn_classification() {
        assert!(SessionDbError::BadConnection("gone".into()).is_bad_conn());
        assert!(!SessionDbError::ExecutionError("syntax".into()).is_bad_conn());
        let template: Arc<str> = Arc::from("SELECT 1");
        let wrapped = SessionDbError::prepare(&template, SessionDbError::BadConnection("x".into()));
        assert!(wrapped.is_bad_conn());
    }
}
