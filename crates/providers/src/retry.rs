//! Exponential backoff for retryable transport failures.

use std::future::Future;
use std::time::Duration;

use stepwise_core::{AbortSignal, TransportError};
use tracing::warn;

/// How often, and how patiently, to retry a transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay.max(self.initial_delay))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. The attempt number (1-based) is passed to `op`.
///
/// Waiting between attempts is cut short by `signal`.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    signal: &AbortSignal,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 1;
    loop {
        if signal.is_aborted() {
            return Err(TransportError::Cancelled(signal.reason()));
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transport call failed, retrying"
                );
                signal
                    .race(tokio::time::sleep(delay))
                    .await
                    .map_err(|_| TransportError::Cancelled(signal.reason()))?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> TransportError {
        TransportError::Status {
            status_code: 503,
            message: "busy".into(),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_backoff(&RetryPolicy::default(), &AbortSignal::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 3 { Err(busy()) } else { Ok(attempt) } }
        })
        .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_backoff(&RetryPolicy::default(), &AbortSignal::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(busy()) }
        })
        .await;
        assert!(matches!(out, Err(TransportError::Status { status_code: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_backoff(&RetryPolicy::default(), &AbortSignal::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TransportError::Status {
                    status_code: 401,
                    message: "bad key".into(),
                })
            }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_interrupts_backoff() {
        let signal = AbortSignal::new();
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(3600),
            ..RetryPolicy::default()
        };
        let aborter = signal.clone();
        let out: Result<(), _> = with_backoff(&policy, &signal, |_| {
            aborter.abort("user cancelled");
            async { Err(busy()) }
        })
        .await;
        assert!(matches!(out, Err(TransportError::Cancelled(reason)) if reason == "user cancelled"));
    }
}
