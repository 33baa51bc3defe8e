use rand::Rng;
use std::time::Duration;

/// Exponential backoff for reconnection attempts.
///
/// Each call to [`Backoff::duration`] returns `min * factor^attempts`, moved
/// up or down by a random share of at most `jitter` and capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    ms: u64,
    max: u64,
    factor: u32,
    jitter: f64,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(100, 10_000, 2, 0.0)
    }
}

impl Backoff {
    /// `jitter` is clamped into `0.0..=1.0`.
    pub fn new(min: u64, max: u64, factor: u32, jitter: f64) -> Self {
        Backoff {
            ms: min,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// The delay before the next attempt. Counts as an attempt.
    pub fn duration(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let mut ms = self.ms as f64 * f64::from(self.factor).powi(exponent);
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let rand: f64 = rng.gen();
            let deviation = (rand * self.jitter * ms).floor();
            ms = if rng.gen::<bool>() {
                ms - deviation
            } else {
                ms + deviation
            };
        }

        Duration::from_millis(ms.min(self.max as f64).max(0.0) as u64)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn set_min(&mut self, min: u64) {
        self.ms = min;
    }

    pub fn set_max(&mut self, max: u64) {
        self.max = max;
    }

    pub fn set_jitter(&mut self, jitter: f64) {
        self.jitter = jitter.clamp(0.0, 1.0);
    }
}
