use std::future::Future;
use std::time::Duration;

use bluelink_config::RetryPolicy;
use bluelink_provider::ProviderError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run a plugin call under the retry policy.
///
/// Only retryable provider errors are retried; anything else (and
/// exhaustion) surfaces the last error unchanged. The closure receives the
/// zero-based attempt number.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.first_delay;
    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let wait = jittered(delay, policy.jitter);
                debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying plugin call");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                delay = next_delay(delay, policy);
            }
            Err(e) => return Err(e),
        }
    }
}

fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    current.mul_f64(policy.backoff_factor).min(policy.max_delay)
}

/// Full jitter in `[0.5, 1.5) × delay`, keeping the expected value at the
/// configured delay.
fn jittered(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    delay.mul_f64(0.5 + rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            first_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    fn transient() -> ProviderError {
        ProviderError::PluginCallFailed {
            resource_type: "test/compute/unit".into(),
            message: "transient".into(),
            retryable: true,
        }
    }

    #[tokio::test]
    async fn succeeds_within_retry_budget() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        // 3 failures then success, within max_retries = 3.
        let result = with_retries(&policy(3), &cancel, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_plugin_call_failed() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_retries(&policy(2), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            ProviderError::PluginCallFailed { .. }
        ));
        // Initial attempt + max_retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_retries(&policy(5), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProviderError::PluginCallFailed {
                    resource_type: "test/compute/unit".into(),
                    message: "fatal".into(),
                    retryable: false,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = with_retries(&policy(5), &cancel, |_| async {
            Err(transient())
        })
        .await;
        assert!(matches!(result.unwrap_err(), ProviderError::Cancelled));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let p = policy(5);
        let mut delay = p.first_delay;
        for _ in 0..10 {
            delay = next_delay(delay, &p);
        }
        assert_eq!(delay, p.max_delay);
    }
}
