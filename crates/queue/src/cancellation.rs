//! Cancellation helpers for job handlers.
//!
//! Handlers receive the job's `CancellationToken`. Wrapping a network or
//! browser call with `.with_cancellation(&token, "context")` races it
//! against the token, so `cancel_for_user` aborts in-flight work instead of
//! waiting for it to finish.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ad_radar_common::{ScrapeError, ScrapeResult};

pub trait CancellationExt<T> {
    /// Resolve with `ScrapeError::Cancelled` as soon as `token` fires,
    /// dropping the wrapped future.
    fn with_cancellation<'a>(
        self,
        token: &'a CancellationToken,
        context: &'a str,
    ) -> impl Future<Output = ScrapeResult<T>> + Send + 'a
    where
        Self: 'a;
}

#[allow(clippy::manual_async_fn)] // Lifetime bounds make async fn impractical here
impl<F, T, E> CancellationExt<T> for F
where
    F: Future<Output = Result<T, E>> + Send,
    E: Into<ScrapeError>,
{
    fn with_cancellation<'a>(
        self,
        token: &'a CancellationToken,
        context: &'a str,
    ) -> impl Future<Output = ScrapeResult<T>> + Send + 'a
    where
        Self: 'a,
    {
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("{}: cancellation signal received", context);
                    Err(ScrapeError::cancelled(format!("{} aborted", context)))
                }
                result = self => result.map_err(Into::into),
            }
        }
    }
}

/// Check point for code between awaits: fail if cancellation was requested.
pub fn check_cancellation(token: &CancellationToken, context: &str) -> ScrapeResult<()> {
    if token.is_cancelled() {
        debug!("{}: cancellation detected", context);
        Err(ScrapeError::cancelled(format!("{} cancelled", context)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_successful_operation() {
        let token = CancellationToken::new();

        async fn fetch() -> ScrapeResult<String> {
            Ok("body".to_string())
        }

        let result = fetch().with_cancellation(&token, "fetch").await;
        assert_eq!(result.unwrap(), "body");
    }

    #[tokio::test]
    async fn test_cancellation_aborts_pending_operation() {
        let token = CancellationToken::new();

        async fn slow_fetch() -> ScrapeResult<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("should not reach here".to_string())
        }

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = slow_fetch().with_cancellation(&token, "slow_fetch").await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_original_error_propagation() {
        let token = CancellationToken::new();

        async fn failing() -> ScrapeResult<String> {
            Err(ScrapeError::Network("connection reset".to_string()))
        }

        match failing().with_cancellation(&token, "failing").await {
            Err(ScrapeError::Network(msg)) => assert!(msg.contains("reset")),
            other => panic!("Expected network error, got {:?}", other),
        }
    }

    #[test]
    fn test_check_cancellation() {
        let token = CancellationToken::new();
        assert!(check_cancellation(&token, "before").is_ok());
        token.cancel();
        assert!(check_cancellation(&token, "after").unwrap_err().is_cancelled());
    }
}
