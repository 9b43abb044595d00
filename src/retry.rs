//! Fixed-delay retry for control-plane calls.

use crate::error::RetryError;

use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time;

/// Attempt count and the pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// Sleeps `policy.delay` between attempts, never after the last one. A
/// policy of zero attempts still runs `op` once.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    action: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                warn!("{} failed (attempt {}/{}): {}, giving up", action, attempt, max_attempts, e);
                return Err(RetryError {
                    action: action.to_string(),
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", action, attempt, max_attempts, e);
                time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
