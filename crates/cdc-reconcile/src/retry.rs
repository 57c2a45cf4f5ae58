//! Exponential-backoff retry policy.
//!
//! A [`RetryPolicy`] decides, per failure, whether another attempt is made
//! and how long to wait before it. Classification is pluggable; the default
//! classifier is [`ReconcileError::is_retryable`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ReconcileError, Result};

/// Predicate deciding whether an error is transient.
pub type Classifier = Arc<dyn Fn(&ReconcileError) -> bool + Send + Sync>;

/// Retry settings as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 200).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff multiplier (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on any single delay in milliseconds (default: 10000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Apply +/-25% jitter to each delay (default: true).
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_multiplier(self.multiplier)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// Exponential-backoff executor with transient/fatal classification.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: bool,
    classifier: Classifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().to_policy()
    }
}

impl RetryPolicy {
    /// Policy making at most `max_attempts` attempts in total.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
            classifier: Arc::new(ReconcileError::is_retryable),
        }
    }

    /// Single attempt, never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the transient/fatal classifier.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&ReconcileError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, err: &ReconcileError) -> bool {
        (self.classifier)(err)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(-0.25..=0.25) * millis;
        Duration::from_millis((millis + jitter).max(0.0) as u64)
    }

    /// Decide what happens after `attempt` (1-based) failed with `err`.
    ///
    /// Returns the delay before the next attempt, or the error to surface.
    pub fn on_failure(&self, err: ReconcileError, attempt: u32) -> std::result::Result<Duration, ReconcileError> {
        if !self.is_retryable(&err) {
            return Err(err);
        }
        if attempt >= self.max_attempts {
            return Err(ReconcileError::RetryExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }
        Ok(self.delay_for(attempt))
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let message = err.to_string();
                    let delay = self.on_failure(err, attempt)?;
                    warn!(
                        "{}: attempt {}/{} failed: {}. Retrying in {:?}",
                        operation, attempt, self.max_attempts, message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_retryable_failure_attempted_max_times() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(4)
            .execute("ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReconcileError::connectivity("mssql", "connection reset"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(ReconcileError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(source.to_string().contains("connection reset"));
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_failure_attempted_once() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(5)
            .execute("ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReconcileError::query("postgres", "syntax error"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ReconcileError::Query { .. })));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = fast(3)
            .execute("ping", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ReconcileError::timeout("ping", Duration::from_millis(5)))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let calls = AtomicU32::new(0);
        let policy = fast(3).with_classifier(|e| matches!(e, ReconcileError::Query { .. }));
        let _: Result<()> = policy
            .execute("ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReconcileError::query("mssql", "flaky"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter(false);

        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.base_delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_millis(1000));
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_config_to_policy() {
        let policy = RetryConfig::default().to_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(200));
    }
}
