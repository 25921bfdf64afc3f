use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_DELAY: Duration = Duration::from_secs(600);

/// Bounded exponential retry around a single call.
///
/// The delay before attempt `n + 1` is `base_delay * multiplier^(n - 1)`.
/// An error is retried only when `retry_on` accepts it and `give_up` (if any)
/// does not; everything else is returned to the caller straight away.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub retry_on: fn(&Error) -> bool,
    pub give_up: Option<fn(&Error) -> bool>,
}

impl RetryPolicy {
    /// Transport errors, 7 attempts, no give-up predicate.
    pub fn transport() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.0,
            retry_on: Error::is_transient,
            give_up: None,
        }
    }

    /// Transport errors, 5 attempts, and an immediate give-up on any
    /// 4xx/5xx answer.
    pub fn transport_strict() -> Self {
        Self {
            max_attempts: 5,
            give_up: Some(is_error_status),
            ..Self::transport()
        }
    }

    /// Only the "receipt not mined yet" condition, up to 10 attempts.
    pub fn receipt_pending() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.0,
            retry_on: |e| matches!(e, Error::ReceiptPending { .. }),
            give_up: None,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn gives_up_on(&self, error: &Error) -> bool {
        self.give_up.map_or(false, |give_up| give_up(error))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("randomization_factor", &self.randomization_factor)
            .field("give_up", &self.give_up.is_some())
            .finish()
    }
}

fn is_error_status(error: &Error) -> bool {
    error.status().map_or(false, |status| status >= 400)
}

pub fn create_backoff(policy: &RetryPolicy) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: policy.base_delay,
        initial_interval: policy.base_delay,
        randomization_factor: policy.randomization_factor,
        multiplier: policy.multiplier,
        max_interval: MAX_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(policy);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if policy.gives_up_on(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Giving up on non-transient failure"
                    );
                    return Err(e);
                }

                if !(policy.retry_on)(&e) {
                    return Err(e);
                }

                if attempts >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = operation_name,
                            attempt = attempts,
                            retry_after_ms = duration.as_millis() as u64,
                            error = %e,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => {
                        warn!(
                            operation = operation_name,
                            attempts,
                            error = %e,
                            "Backoff exhausted"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }

    #[test]
    fn delays_grow_by_multiplier() {
        let policy = RetryPolicy::transport().with_base_delay(Duration::from_millis(100));
        let mut backoff = create_backoff(&policy);

        let delays: Vec<u128> = (0..4)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::transport().with_base_delay(Duration::from_millis(1));

        let result = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            },
            &policy,
            "flaky",
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn propagates_final_error_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::transport()
            .with_base_delay(Duration::from_millis(1))
            .with_max_attempts(4);

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            },
            &policy,
            "always_down",
        )
        .await;

        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn strict_policy_gives_up_on_404_without_sleeping() {
        let calls = AtomicU32::new(0);
        // A long base delay makes any sleep blow the timeout below.
        let policy = RetryPolicy::transport_strict().with_base_delay(Duration::from_secs(60));

        let result: Result<()> = tokio::time::timeout(
            Duration::from_secs(1),
            retry_with_backoff(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::request("http://localhost/graphql", 404, "not found")) }
                },
                &policy,
                "missing",
            ),
        )
        .await
        .expect("retry loop must not sleep");

        assert!(matches!(result, Err(Error::Request { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::transport().with_base_delay(Duration::from_secs(60));

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Unauthorized {
                        url: "http://localhost".into(),
                        status: 401,
                    })
                }
            },
            &policy,
            "auth",
        )
        .await;

        assert!(matches!(result, Err(Error::Unauthorized { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn receipt_policy_only_retries_pending() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::receipt_pending().with_base_delay(Duration::from_millis(1));

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            },
            &policy,
            "receipt",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::ReceiptPending {
                        transaction: "0x01".into(),
                    })
                }
            },
            &policy,
            "receipt",
        )
        .await;
        assert!(matches!(result, Err(Error::ReceiptPending { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
