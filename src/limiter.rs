use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep_until};

/// Minimum-spacing gate shared by every task that talks to a throttled peer.
///
/// The previous grant time lives behind one async mutex; the wait and the
/// update both happen while the lock is held, so concurrent callers queue
/// on the lock (FIFO) instead of racing on a stale timestamp.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_grant: Mutex::new(None),
        }
    }

    /// Blocks until a slot is free, then returns the instant it was granted.
    pub async fn acquire_slot(&self) -> Instant {
        let mut last = self.last_grant.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }
        let granted = Instant::now();
        *last = Some(granted);
        granted
    }
}
