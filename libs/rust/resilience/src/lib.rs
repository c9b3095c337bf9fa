//! Retry helpers for batch-side registry calls (scoring, publishing).
//!
//! The serving path never retries internally: a failed load is reported and
//! the next request tries again.
use futures::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy { pub attempts: usize, pub delay: Duration }

impl Default for RetryPolicy { fn default() -> Self { Self { attempts: 3, delay: Duration::from_millis(500) } } }

/// Run `f` up to `policy.attempts` times, sleeping `policy.delay` between
/// tries. Stops early on success or when `retryable` rejects the error.
pub async fn retry_async_when<F, Fut, T, E, P>(policy: RetryPolicy, mut f: F, retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => {
                if attempt > 1 { debug!(attempt, "succeeded after retry"); }
                return Ok(v);
            }
            Err(e) if attempt >= attempts || !retryable(&e) => return Err(e),
            Err(e) => {
                warn!(attempt, max = attempts, error = %e, "attempt failed, retrying");
                tokio::time::sleep(policy.delay).await;
            }
        }
        attempt += 1;
    }
}

/// Retry on every error.
pub async fn retry_async<F, Fut, T, E>(policy: RetryPolicy, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_when(policy, f, |_| true).await
}
