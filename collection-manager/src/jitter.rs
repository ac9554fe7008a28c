use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Random delay inserted before each platform call.
#[derive(Clone, Copy, Debug)]
pub struct Jitter {
    min_ms: u64,
    max_ms: u64,
}

impl Jitter {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms,
        }
    }

    /// No delay at all.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn sample(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }

    /// Sleeps for one sample. Returns false if cancelled first.
    pub async fn sleep(&self, cancel: &CancellationToken) -> bool {
        let delay = self.sample();
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
