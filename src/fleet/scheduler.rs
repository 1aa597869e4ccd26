//! Periodic scheduler with random jitter

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PeriodicJitter {
    period: Duration,
    jitter: Duration,
}

impl PeriodicJitter {
    pub fn new(period: Duration, jitter: Duration) -> Self {
        Self { period, jitter }
    }

    pub fn next_delay(&self) -> Duration {
        let jitter = self.jitter.as_millis() as u64;
        if jitter == 0 {
            return self.period;
        }
        self.period + Duration::from_millis(rand::rng().random_range(0..=jitter))
    }

    /// Wait for the next tick. Returns `false` when `token` is cancelled.
    pub async fn tick(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.next_delay()) => true,
        }
    }
}
