use crate::metrics::FulcrumMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Configuration for retry logic with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    pub fn persistent() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter_factor: 0.2,
        }
    }

    pub fn storage() -> Self {
        Self {
            max_attempts: 7,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 1.8,
            jitter_factor: 0.15,
        }
    }
}

/// Retryable failures surfaced by the components built on top of
/// `RetryExecutor`: the provision lock (C8), the KV mirror (C6), and the
/// route dispatch path (C9, §4.9.8 retryable-reason set).
#[derive(Debug, Clone)]
pub enum RetryableError {
    ProvisionLockBusy(String),
    ConnectionError(String),
    BackendNotFound,
    BackendOffline,
    SlotNotReady,
    RouteTransient(String),
    ResourceUnavailable(String),
    Generic(String),
}

impl std::fmt::Display for RetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProvisionLockBusy(msg) => write!(f, "provision lock busy: {msg}"),
            Self::ConnectionError(msg) => write!(f, "connection error: {msg}"),
            Self::BackendNotFound => write!(f, "backend-not-found"),
            Self::BackendOffline => write!(f, "backend-offline"),
            Self::SlotNotReady => write!(f, "slot-not-ready"),
            Self::RouteTransient(msg) => write!(f, "route-transient: {msg}"),
            Self::ResourceUnavailable(msg) => write!(f, "resource unavailable: {msg}"),
            Self::Generic(msg) => write!(f, "generic error: {msg}"),
        }
    }
}

impl std::error::Error for RetryableError {}

/// Retry executor with exponential backoff and jitter.
pub struct RetryExecutor {
    config: RetryConfig,
    metrics: Option<Arc<FulcrumMetrics>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, metrics: None }
    }

    pub fn with_metrics(config: RetryConfig, metrics: Arc<FulcrumMetrics>) -> Self {
        Self { config, metrics: Some(metrics) }
    }

    /// Execute an operation with retry logic, deciding retryability from
    /// the formatted error via [`is_retryable_error`].
    pub async fn execute<T, F, Fut, E>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<RetryableError> + std::fmt::Debug,
    {
        self.execute_with_condition(operation_name, operation, |error| is_retryable_error(error))
            .await
    }

    /// Execute operation with a custom retry condition.
    pub async fn execute_with_condition<T, F, Fut, E, R>(
        &self,
        operation_name: &str,
        operation: F,
        retry_condition: R,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Debug,
    {
        let mut attempt = 1;
        let mut delay = self.config.initial_delay;

        loop {
            if let Some(metrics) = &self.metrics {
                metrics.increment_retry_attempts();
            }

            debug!(
                operation = operation_name,
                attempt,
                max_attempts = self.config.max_attempts,
                "executing operation attempt"
            );

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "operation succeeded after retry");
                        if let Some(metrics) = &self.metrics {
                            metrics.increment_retry_successes();
                        }
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if attempt >= self.config.max_attempts {
                        error!(operation = operation_name, attempt, error = ?error, "operation failed after all retry attempts");
                        return Err(error);
                    }

                    if !retry_condition(&error) {
                        debug!(operation = operation_name, error = ?error, "error is not retryable, failing immediately");
                        return Err(error);
                    }

                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = ?error,
                        delay_ms = delay.as_millis(),
                        "operation failed, retrying after delay"
                    );

                    sleep(delay).await;

                    let next_delay =
                        Duration::from_millis((delay.as_millis() as f64 * self.config.backoff_multiplier) as u64);
                    delay = std::cmp::min(next_delay, self.config.max_delay);

                    if self.config.jitter_factor > 0.0 {
                        let jitter = (delay.as_millis() as f64 * self.config.jitter_factor) as u64;
                        let jitter_amount = fastrand::u64(0..=jitter);
                        delay = Duration::from_millis(delay.as_millis() as u64 + jitter_amount);
                    }

                    attempt += 1;
                }
            }
        }
    }
}

/// Whether the formatted form of `error` matches a known retryable pattern.
/// Used as the default condition for [`RetryExecutor::execute`]; callers
/// with a typed error (e.g. the routing coordinator's retryable-reason
/// set) should prefer `execute_with_condition`.
pub fn is_retryable_error<E: std::fmt::Debug>(error: &E) -> bool {
    let error_str = format!("{error:?}").to_lowercase();

    if error_str.contains("lock busy")
        || error_str.contains("connection")
        || error_str.contains("timeout")
        || error_str.contains("backend-not-found")
        || error_str.contains("backend-offline")
        || error_str.contains("slot-not-ready")
        || error_str.contains("route-transient")
        || error_str.contains("unavailable")
    {
        return true;
    }

    error_str.contains("io error")
        || error_str.contains("broken pipe")
        || error_str.contains("connection reset")
        || error_str.contains("connection refused")
}

/// Convenience wrapper for the KV mirror's write-through retries.
pub async fn retry_storage_operation<T, F, Fut>(
    operation_name: &str,
    operation: F,
    metrics: Option<Arc<FulcrumMetrics>>,
) -> Result<T, anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let executor = match metrics {
        Some(metrics) => RetryExecutor::with_metrics(RetryConfig::storage(), metrics),
        None => RetryExecutor::new(RetryConfig::storage()),
    };

    executor.execute(operation_name, operation).await
}

/// Convenience wrapper for C9's bounded route dispatch retry (§4.9.8).
pub async fn retry_route_operation<T, F, Fut>(
    operation_name: &str,
    operation: F,
    metrics: Option<Arc<FulcrumMetrics>>,
) -> Result<T, anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let executor = match metrics {
        Some(metrics) => RetryExecutor::with_metrics(RetryConfig::fast(), metrics),
        None => RetryExecutor::new(RetryConfig::fast()),
    };

    executor.execute(operation_name, operation).await
}

/// Convenience wrapper for C8's provision-lock acquisition retry.
pub async fn retry_provision_operation<T, F, Fut>(
    operation_name: &str,
    operation: F,
    metrics: Option<Arc<FulcrumMetrics>>,
) -> Result<T, anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let executor = match metrics {
        Some(metrics) => RetryExecutor::with_metrics(RetryConfig::persistent(), metrics),
        None => RetryExecutor::new(RetryConfig::persistent()),
    };

    executor.execute(operation_name, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn successful_operation_returns_immediately() {
        let executor = RetryExecutor::new(RetryConfig::default());

        let result = executor.execute("test", || async { Ok::<i32, anyhow::Error>(42) }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = StdArc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryConfig::fast());

        let counter_clone = counter.clone();
        let result = executor
            .execute("test_retry", move || {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if attempt < 3 {
                        Err(anyhow::anyhow!("slot-not-ready"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(RetryConfig { max_attempts: 2, ..RetryConfig::fast() });

        let result = executor
            .execute("test_fail", || async { Err::<i32, anyhow::Error>(anyhow::anyhow!("backend-offline")) })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let executor = RetryExecutor::new(RetryConfig::fast());

        let result = executor
            .execute("test_non_retryable", || async {
                Err::<i32, anyhow::Error>(anyhow::anyhow!("match-roster-locked"))
            })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn custom_retry_condition_is_honored() {
        let counter = StdArc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryConfig::fast());

        let counter_clone = counter.clone();
        let result = executor
            .execute_with_condition(
                "test_custom",
                move || {
                    let counter = counter_clone.clone();
                    async move {
                        let attempt = counter.fetch_add(1, Ordering::Relaxed) + 1;
                        if attempt < 2 {
                            Err(anyhow::anyhow!("custom retryable error"))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |error: &anyhow::Error| error.to_string().contains("custom retryable"),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 2);
    }
}
