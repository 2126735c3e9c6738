use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SessionDbError;

/// Per-call context attached to a handle's statement at derivation time.
///
/// The token flows unchanged into every execute/query made through the
/// handle and its copies.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl QueryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the context was already cancelled.
    ///
    /// # Errors
    /// Returns [`SessionDbError::Cancelled`].
    pub fn check(&self) -> Result<(), SessionDbError> {
        if self.cancel.is_cancelled() {
            Err(SessionDbError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` unless the context is cancelled or times out first.
    ///
    /// # Errors
    /// Returns [`SessionDbError::Cancelled`] or [`SessionDbError::Timeout`], or the
    /// future's own error.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, SessionDbError>
    where
        F: Future<Output = Result<T, SessionDbError>>,
    {
        self.check()?;
        let guarded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| SessionDbError::Timeout(limit))?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SessionDbError::Cancelled),
            res = guarded => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_context_skips_dispatch() {
        let token = CancellationToken::new();
        let ctx = QueryContext::with_cancellation(token.clone());
        token.cancel();
        let res = ctx.run(async { Ok::<_, SessionDbError>(1) }).await;
        assert!(matches!(res, Err(SessionDbError::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let ctx = QueryContext::new().timeout(Duration::from_millis(5));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SessionDbError>(())
            })
            .await;
        assert!(matches!(res, Err(SessionDbError::Timeout(_))));
    }
}
