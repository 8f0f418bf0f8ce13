use async_trait::async_trait;
use ergon_core::{ErgonError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::provider::*;

/// Default retry attempts for transient errors (429, 500, 502, 503).
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay for exponential backoff (doubles each retry).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Check if an error is transient and worth retrying.
pub fn is_retryable(err: &ErgonError) -> bool {
    match err {
        ErgonError::RateLimited { .. } => true,
        ErgonError::Backend(msg) => {
            msg.starts_with("HTTP 429")
                || msg.starts_with("HTTP 500")
                || msg.starts_with("HTTP 502")
                || msg.starts_with("HTTP 503")
                || msg.starts_with("HTTP 529")
                || msg.contains("timed out")
                || msg.contains("connection")
                || msg.contains("overloaded")
        }
        _ => false,
    }
}

/// Extract retry-after hint from a RateLimited error.
fn retry_after_hint(err: &ErgonError) -> Option<Duration> {
    if let ErgonError::RateLimited { retry_after_secs } = err {
        Some(Duration::from_secs(*retry_after_secs))
    } else {
        None
    }
}

/// Wraps a backend with exponential-backoff retries on transient errors.
///
/// Once the retries are spent the failure surfaces as
/// [`ErgonError::BackendUnreachable`]; anything non-transient is returned
/// on the first attempt.
pub struct RetryingBackend {
    inner: Arc<dyn ModelBackend>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn ModelBackend>) -> Self {
        Self {
            inner,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn backoff(&self, err: &ErgonError, attempt: u32) -> Duration {
        retry_after_hint(err).unwrap_or_else(|| self.base_delay * 2u32.saturating_pow(attempt))
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt < self.max_retries => {
                    let delay = self.backoff(&e, attempt);
                    warn!(
                        backend = self.inner.name(),
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying {what} after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if is_retryable(&e) => {
                    return Err(ErgonError::BackendUnreachable {
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ModelBackend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.with_retry("completion", || self.inner.complete(request))
            .await
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        self.with_retry("stream", || self.inner.stream(request)).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&ErgonError::RateLimited { retry_after_secs: 1 }));
        assert!(is_retryable(&ErgonError::Backend("HTTP 503: busy".into())));
        assert!(is_retryable(&ErgonError::Backend(
            "local: connection refused".into()
        )));
        assert!(!is_retryable(&ErgonError::Backend("HTTP 400: bad".into())));
        assert!(!is_retryable(&ErgonError::ModelNotFound("x".into())));
    }

    #[test]
    fn test_retry_after_hint_wins_over_backoff() {
        let backend = RetryingBackend::new(Arc::new(crate::MockBackend::new("mock")));
        let hinted = backend.backoff(&ErgonError::RateLimited { retry_after_secs: 7 }, 0);
        assert_eq!(hinted, Duration::from_secs(7));
        let doubled = backend.backoff(&ErgonError::Backend("HTTP 500".into()), 2);
        assert_eq!(doubled, Duration::from_millis(4000));
    }
}
