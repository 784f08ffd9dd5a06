use std::time::Duration;

use rand::Rng;

use crate::error::{SyncError, SyncErrorCode};

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
const JITTER_FACTOR: f64 = 0.5;

#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MILLIS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MILLIS),
            factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Exponential backoff with ±50% jitter and a hard cap.
///
/// `reset` is called after a fully successful round trip; a resource-
/// exhausted rejection escalates straight to the cap.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    pub fn max_out(&mut self) {
        self.current_base = self.config.max_delay;
    }

    /// Adjusts the schedule for `error` (resource exhaustion skips to the
    /// cap) and returns the next delay.
    pub fn next_delay_for(&mut self, error: Option<&SyncError>) -> Duration {
        if matches!(error, Some(err) if err.code == SyncErrorCode::ResourceExhausted) {
            self.max_out();
        }
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_millis() as f64;
        let jitter = JITTER_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = (base + jitter)
            .round()
            .clamp(0.0, self.config.max_delay.as_millis() as f64);

        let next_base = if self.current_base.is_zero() {
            self.config.initial_delay
        } else {
            self.current_base.mul_f64(self.config.factor)
        };
        self.current_base = next_base.min(self.config.max_delay);

        Duration::from_millis(delay as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
