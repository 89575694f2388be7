use crate::config::models::RetryConfig;
use crate::core::error::UpdateError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, warn};

/// Delays between attempts: `base_delay`, then doubling, capped at `max_delay`.
pub(crate) fn backoff(policy: &RetryConfig) -> impl Iterator<Item = Duration> + use<> {
    let factor = (policy.base_delay.as_millis() as u64 / 2).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(policy.max_delay)
        .take(policy.max_attempts.saturating_sub(1) as usize)
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the attempt budget is spent.
/// A spent budget is reported as `RetriesExhausted` carrying the last cause.
pub(crate) async fn with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    what: &str,
    mut op: F,
) -> Result<T, UpdateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpdateError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let attempts = AtomicU32::new(0);

    let result = RetryIf::spawn(
        backoff(policy),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("{} (attempt {}/{})", what, attempt, max_attempts);
            op()
        },
        |e: &UpdateError| {
            let retry = e.is_transient();
            if retry {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    what,
                    attempts.load(Ordering::SeqCst),
                    max_attempts,
                    e
                );
            }
            retry
        },
    )
    .await;

    match result {
        Err(e) if e.is_transient() => Err(UpdateError::RetriesExhausted {
            attempts: attempts.load(Ordering::SeqCst),
            source: Box::new(e),
        }),
        other => other,
    }
}
