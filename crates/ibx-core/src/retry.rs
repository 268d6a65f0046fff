//! Retry executor wrapping storage operations.
//!
//! Backends classify their own faults: connection loss, serialization
//! failures, deadlocks, and timeouts are transient and retried with
//! exponential backoff; everything else surfaces immediately. Cancellation
//! is honored inside the backoff delay and is never itself retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::message::{DeadLetterMessage, Message};
use crate::provider::{ProcessResults, StorageHealthMetrics, StorageProvider};

/// Distinguishes faults worth another attempt from permanent failures.
pub trait ErrorClassifier: Send + Sync {
    fn is_transient(&self, error: &anyhow::Error) -> bool;
}

/// Classifier that never retries. Useful for in-memory stores and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTransient;

impl ErrorClassifier for NeverTransient {
    fn is_transient(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Spread delays by ±25% to avoid retry stampedes.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `next_attempt` (2 = first retry).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2);
        let base = self
            .initial_delay
            .mul_f64(self.multiplier.powi(exponent as i32))
            .min(self.max_delay);
        if self.jitter {
            let factor = 0.75 + rand::random::<f64>() * 0.5;
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Run `op`, retrying transient failures per `policy`.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    classifier: &dyn ErrorClassifier,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !classifier.is_transient(&err) {
                    return Err(err);
                }
                let delay = policy.delay_before(attempt + 1);
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "transient storage failure, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(err).context("operation canceled during retry backoff");
                    }
                }
                attempt += 1;
            }
        }
    }
}

/// Storage decorator applying the retry executor to every operation.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
    cancel: CancellationToken,
}

impl<P: StorageProvider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            inner,
            policy,
            classifier,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie backoff delays to an external cancellation scope.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: StorageProvider> StorageProvider for RetryingProvider<P> {
    fn inbox_name(&self) -> &str {
        self.inner.inbox_name()
    }

    async fn write_batch(&self, messages: Vec<Message>) -> anyhow::Result<()> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "write_batch", || {
            let messages = messages.clone();
            async move { self.inner.write_batch(messages).await }
        })
        .await
    }

    async fn read_and_capture(&self, processor_id: &str) -> anyhow::Result<Vec<Message>> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "read_and_capture", || {
            self.inner.read_and_capture(processor_id)
        })
        .await
    }

    async fn fail_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "fail_batch", || {
            self.inner.fail_batch(ids)
        })
        .await
    }

    async fn release_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "release_batch", || {
            self.inner.release_batch(ids)
        })
        .await
    }

    async fn move_to_dead_letter_batch(&self, entries: &[(Uuid, String)]) -> anyhow::Result<()> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "move_to_dead_letter_batch",
            || self.inner.move_to_dead_letter_batch(entries),
        )
        .await
    }

    async fn process_results_batch(&self, results: ProcessResults) -> anyhow::Result<()> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "process_results_batch",
            || {
                let results = results.clone();
                async move { self.inner.process_results_batch(results).await }
            },
        )
        .await
    }

    async fn read_dead_letters(&self, count: usize) -> anyhow::Result<Vec<DeadLetterMessage>> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "read_dead_letters", || {
            self.inner.read_dead_letters(count)
        })
        .await
    }

    async fn requeue_dead_letters(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "requeue_dead_letters",
            || self.inner.requeue_dead_letters(ids),
        )
        .await
    }

    async fn extend_locks(
        &self,
        processor_id: &str,
        ids: &[Uuid],
        new_captured_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "extend_locks", || {
            self.inner.extend_locks(processor_id, ids, new_captured_at)
        })
        .await
    }

    async fn health_metrics(&self) -> anyhow::Result<StorageHealthMetrics> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "health_metrics", || {
            self.inner.health_metrics()
        })
        .await
    }

    async fn release_group_locks(&self, group_ids: &[String]) -> anyhow::Result<()> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "release_group_locks",
            || self.inner.release_group_locks(group_ids),
        )
        .await
    }

    async fn release_messages_and_group_locks(&self, messages: &[Message]) -> anyhow::Result<()> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "release_messages_and_group_locks",
            || self.inner.release_messages_and_group_locks(messages),
        )
        .await
    }

    async fn delete_expired_deduplications(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "delete_expired_deduplications",
            || self.inner.delete_expired_deduplications(cutoff, batch),
        )
        .await
    }

    async fn delete_expired_group_locks(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "delete_expired_group_locks",
            || self.inner.delete_expired_group_locks(cutoff, batch),
        )
        .await
    }

    async fn delete_expired_dead_letters(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        with_retries(
            &self.policy,
            self.classifier.as_ref(),
            &self.cancel,
            "delete_expired_dead_letters",
            || self.inner.delete_expired_dead_letters(cutoff, batch),
        )
        .await
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        with_retries(&self.policy, self.classifier.as_ref(), &self.cancel, "migrate", || {
            self.inner.migrate()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysTransient;

    impl ErrorClassifier for AlwaysTransient {
        fn is_transient(&self, _error: &anyhow::Error) -> bool {
            true
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            max_attempts: 3,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(
            &fast_policy(),
            &AlwaysTransient,
            &CancellationToken::new(),
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::anyhow!("transient"))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_retries(
            &fast_policy(),
            &NeverTransient,
            &CancellationToken::new(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("permanent")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_retries(
            &fast_policy(),
            &AlwaysTransient,
            &CancellationToken::new(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("transient")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_retries(
            &RetryPolicy {
                initial_delay: Duration::from_secs(30),
                ..fast_policy()
            },
            &AlwaysTransient,
            &cancel,
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("transient")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry after cancellation");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            max_attempts: 10,
            jitter: false,
        };
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(350));
        assert_eq!(policy.delay_before(5), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1000),
            max_attempts: 2,
            jitter: true,
        };
        for _ in 0..100 {
            let d = policy.delay_before(2);
            assert!(d >= Duration::from_millis(750), "jitter below -25%: {d:?}");
            assert!(d <= Duration::from_millis(1250), "jitter above +25%: {d:?}");
        }
    }
}
