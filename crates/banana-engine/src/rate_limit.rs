use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Spaces outbound requests at least `min_interval` apart.
///
/// Self-throttling only: it keeps us under the provider's limits, it does not
/// bound concurrency. Waiters queue FIFO on the inner mutex.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_granted: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_granted: Mutex::new(None),
        }
    }

    /// Suspends until the interval since the previous turn has passed, then
    /// records now as the latest turn. Returns how long the caller waited.
    pub async fn await_turn(&self) -> Duration {
        let mut last = self.last_granted.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                debug!(wait_ms = waited.as_millis() as u64, "rate limiter holding request");
                sleep(waited).await;
            }
        }
        *last = Some(Instant::now());
        waited
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
