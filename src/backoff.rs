//! # Bounded Retry
//!
//! Exponential backoff schedule for startup paths that wait on a peer, such
//! as the MQTT broker connect. Every retry loop is bounded and reports
//! failure instead of spinning forever.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry schedule: `max_attempts` tries, delay doubling from `initial` up to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial,
            max,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Run `op` until it succeeds or the attempt budget is spent
///
/// Sleeps `policy.delay_for(n)` between attempts. The last error is returned
/// when every attempt failed.
///
/// # Examples
///
/// ```
/// use armcam_node::backoff::{retry, BackoffPolicy};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let policy = BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4));
/// let value: Result<u32, String> = retry(&policy, "answer", || async { Ok(42) }).await;
/// assert_eq!(value, Ok(42));
/// # }
/// ```
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!("{} succeeded after {} retries", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!("{} failed after {} attempts: {}", label, attempt, e);
                    return Err(e);
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
