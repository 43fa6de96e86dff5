//! Bounded retry for transient Kubernetes API failures
//!
//! Only errors for which [`Error::is_transient`] holds are retried; anything
//! else is returned at once. Cluster creation and manifest apply never go
//! through here.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Attempt budget and delay bounds for a retried call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

/// Backoff used for API discovery
pub const DISCOVERY_BACKOFF: Backoff = Backoff {
    attempts: 5,
    initial: Duration::from_secs(1),
    max: Duration::from_secs(10),
};

impl Backoff {
    /// Delay before retry `retry` (1-based): doubled per retry, capped at
    /// `max`, then scaled by 0.5x to 1.5x jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(16);
        let base = self.initial.saturating_mul(1 << doublings).min(self.max);
        base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// Run `operation`, retrying transient failures within `backoff`.
///
/// Returns the first non-transient error, or the last error once attempts
/// run out.
pub async fn retry_transient<F, Fut, T>(backoff: &Backoff, what: &str, mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < backoff.attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation = %what,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    error!(operation = %what, attempt, error = %e, "giving up after max attempts");
                }
                return Err(e);
            }
        }
    }
}
