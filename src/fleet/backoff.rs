//! Exponential backoff with equal jitter
//!
//! Each wait sleeps between half and all of the current delay, then doubles
//! the delay up to the cap. [`Backoff::reset`] starts over after a success.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Backoff {
    init: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(init: Duration, max: Duration) -> Self {
        let max = max.max(init);
        Self {
            init,
            max,
            current: init,
        }
    }

    /// Delay of the next wait; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let half = base / 2;
        let spread = (base - half).as_millis() as u64;
        if spread == 0 {
            return base;
        }
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    pub fn reset(&mut self) {
        self.current = self.init;
    }

    /// Sleep for `delay` unless `token` is cancelled first. Returns `false`
    /// on cancellation.
    pub async fn wait(delay: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
