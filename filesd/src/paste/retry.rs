use std::time::Duration;

use files_core::ApiError;
use rand::Rng;

use crate::config::EngineConfig;

/// Longest wait between chunk attempts, as a multiple of the base delay.
const CEILING_FACTOR: u32 = 16;

/// Attempts left for one upload chunk, and the wait before each retry.
///
/// Waits use decorrelated jitter: each delay is drawn between the base and
/// three times the previous delay, then capped. A `Retry-After` hint from
/// the service replaces the draw and becomes the new previous delay.
#[derive(Debug, Clone)]
pub(crate) struct ChunkRetry {
    attempts: u32,
    used: u32,
    base: Duration,
    ceiling: Duration,
    previous: Duration,
}

impl ChunkRetry {
    pub(crate) fn new(attempts: u32, base: Duration, ceiling: Duration) -> Self {
        let base = base.min(ceiling);
        Self {
            attempts: attempts.max(1),
            used: 1,
            base,
            ceiling,
            previous: base,
        }
    }

    pub(crate) fn for_uploads(config: &EngineConfig) -> Self {
        Self::new(
            config.upload_retries,
            config.retry_base,
            config.retry_base.saturating_mul(CEILING_FACTOR),
        )
    }

    /// Attempts made so far, counting the first one.
    pub(crate) fn attempts_made(&self) -> u32 {
        self.used
    }

    /// Spends an attempt after `err`. `None` once the budget is used up.
    pub(crate) fn next_delay(&mut self, err: &ApiError) -> Option<Duration> {
        self.next_delay_with(err, &mut rand::thread_rng())
    }

    fn next_delay_with<R: Rng + ?Sized>(&mut self, err: &ApiError, rng: &mut R) -> Option<Duration> {
        if self.used >= self.attempts {
            return None;
        }
        self.used += 1;
        let delay = match err.retry_after() {
            Some(hint) => hint.min(self.ceiling),
            None => {
                let upper = self.previous.saturating_mul(3).min(self.ceiling);
                if upper <= self.base {
                    self.base
                } else {
                    rng.gen_range(self.base..=upper)
                }
            }
        };
        self.previous = delay.max(self.base);
        Some(delay)
    }
}
