//! Exponential backoff for transient store throttling.
//!
//! The delay starts at 50ms and doubles after every sleep, jittered by a
//! uniform multiplier in `[0, 1)`. One instance is scoped to a single
//! multi-step operation (a batch-get retry loop, a bulk delete) and is
//! never shared or persisted.

use std::time::Duration;

use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ExponentialBackoff {
    delay: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self { delay: INITIAL_DELAY }
    }

    /// Sleep for a jittered slice of the current delay, then double it.
    pub async fn sleep(&mut self) {
        let jitter: f64 = rand::random();
        let pause = self.delay.mul_f64(jitter);
        debug!(pause_ms = pause.as_millis() as u64, "backing off");
        tokio::time::sleep(pause).await;
        self.delay *= 2;
    }

    /// Sleep only when `condition` holds.
    pub async fn sleep_when(&mut self, condition: bool) {
        if condition {
            self.sleep().await;
        }
    }

    /// The full (un-jittered) delay the next sleep will draw from.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delay_doubles_after_each_sleep() {
        let mut backoff = ExponentialBackoff::new();
        assert_eq!(backoff.current_delay(), Duration::from_millis(50));

        backoff.sleep().await;
        assert_eq!(backoff.current_delay(), Duration::from_millis(100));

        backoff.sleep().await;
        assert_eq!(backoff.current_delay(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_when_false_is_a_no_op() {
        let mut backoff = ExponentialBackoff::new();
        backoff.sleep_when(false).await;
        assert_eq!(backoff.current_delay(), Duration::from_millis(50));

        backoff.sleep_when(true).await;
        assert_eq!(backoff.current_delay(), Duration::from_millis(100));
    }
}
