//! Retry with exponential backoff.
//!
//! Startup steps that must eventually succeed (bootstrap, waiting for DHCP behind a hidden
//! uplink) retry without a ceiling, while bounded waits such as SLAAC give up after a fixed
//! elapsed time. Both are expressed through [`ExponentialBackoffConfig`].

use crate::error::NetworkError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExponentialBackoffConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Maximum number of retries, `None` retries until the duration bound
    pub max_retries: Option<u32>,
    /// Multiplier for each retry
    pub multiplier: f64,
    /// Whether to add jitter to the delay
    pub jitter: bool,
    /// Maximum total duration for all retries in milliseconds, `None` never gives up on time
    pub max_duration_ms: Option<u64>,
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            max_retries: None,
            multiplier: 1.5,
            jitter: true,
            max_duration_ms: Some(15 * 60 * 1000),
        }
    }
}

impl ExponentialBackoffConfig {
    /// Retry forever.
    pub fn unbounded() -> Self {
        Self {
            max_duration_ms: None,
            ..Self::default()
        }
    }

    /// Retry until `limit` has elapsed since the first attempt.
    pub fn bounded_by(limit: Duration) -> Self {
        Self {
            max_duration_ms: Some(limit.as_millis() as u64),
            ..Self::default()
        }
    }

    /// Retry a fixed number of times with a constant delay.
    pub fn constant(delay: Duration, retries: u32) -> Self {
        Self {
            initial_delay_ms: delay.as_millis() as u64,
            max_delay_ms: delay.as_millis() as u64,
            max_retries: Some(retries),
            multiplier: 1.0,
            jitter: false,
            max_duration_ms: None,
        }
    }
}

/// Trait for errors that can be retried
pub trait RetryableError {
    /// Check if the error is retryable
    fn is_retryable(&self) -> bool {
        true
    }

    /// Create an error from a string
    fn from_error(msg: &str) -> Self;
}

impl RetryableError for NetworkError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn from_error(msg: &str) -> Self {
        NetworkError::Timeout {
            what: msg.to_string(),
        }
    }
}

/// Retry policy implementation
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Operation name used in logs
    operation: String,
    config: ExponentialBackoffConfig,
}

impl RetryPolicy {
    pub fn new(operation: impl Into<String>, config: ExponentialBackoffConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
        }
    }

    /// Delay before retry number `attempt` (1 based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let config = &self.config;
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_delay_ms = (config.initial_delay_ms as f64 * config.multiplier.powi(exponent)) as u64;
        let capped_delay_ms = base_delay_ms.min(config.max_delay_ms);

        let final_delay_ms = if config.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.8..1.2);
            (capped_delay_ms as f64 * jitter_factor) as u64
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }

    /// Execute a function with retry
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + RetryableError,
    {
        self.execute_until(&CancellationToken::new(), f).await
    }

    /// Execute a function with retry, giving up early once `cancel` fires.
    pub async fn execute_until<F, Fut, T, E>(&self, cancel: &CancellationToken, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + RetryableError,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = %self.operation, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(operation = %self.operation, error = %err, "non-retryable error");
                return Err(err);
            }

            attempt += 1;
            if let Some(max_retries) = self.config.max_retries {
                if attempt > max_retries {
                    warn!(operation = %self.operation, max_retries, error = %err, "retries exhausted");
                    return Err(err);
                }
            }

            let delay = self.delay_for(attempt);
            if let Some(max_duration_ms) = self.config.max_duration_ms {
                let elapsed = start.elapsed() + delay;
                if elapsed.as_millis() as u64 > max_duration_ms {
                    warn!(
                        operation = %self.operation,
                        max_duration_ms,
                        error = %err,
                        "retry duration exceeded"
                    );
                    return Err(err);
                }
            }

            warn!(
                operation = %self.operation,
                attempt,
                error = %err,
                "operation failed, retrying in {}ms",
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(E::from_error(&format!("{} cancelled", self.operation)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(retries: Option<u32>) -> ExponentialBackoffConfig {
        ExponentialBackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            max_retries: retries,
            multiplier: 2.0,
            jitter: false,
            max_duration_ms: None,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new("flaky", fast(None));

        let counter = calls.clone();
        let result: Result<u32, NetworkError> = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(NetworkError::kernel("probe", "eth0", "not yet"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_bounded_retries_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new("bounded", fast(Some(2)));

        let counter = calls.clone();
        let result: Result<(), NetworkError> = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(NetworkError::kernel("route get", "npub6", "no route"))
                }
            })
            .await;

        assert!(matches!(result, Err(NetworkError::Kernel { .. })));
        // first attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new("validate", fast(None));

        let counter = calls.clone();
        let result: Result<(), NetworkError> = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(NetworkError::validation("bad"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new("reserve", fast(Some(5)));

        let counter = calls.clone();
        let result: Result<(), NetworkError> = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(NetworkError::NoDefaultGateway)
                    } else {
                        Err(NetworkError::PortConflict { port: 6010 })
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(NetworkError::PortConflict { port: 6010 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_unbounded_retry() {
        let policy = RetryPolicy::new(
            "forever",
            ExponentialBackoffConfig {
                initial_delay_ms: 50,
                max_delay_ms: 50,
                ..fast(None)
            },
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), NetworkError> = policy
            .execute_until(&cancel, || async { Err(NetworkError::kernel("dhcp", "npub4", "no lease")) })
            .await;

        assert!(matches!(result, Err(NetworkError::Timeout { .. })));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(
            "cap",
            ExponentialBackoffConfig {
                initial_delay_ms: 100,
                max_delay_ms: 400,
                jitter: false,
                multiplier: 2.0,
                ..ExponentialBackoffConfig::default()
            },
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_millis(400));
    }
}
