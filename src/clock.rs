use std::time::{Duration, Instant};

/// Monotonic timestamp, seconds since an arbitrary fixed origin for this
/// process. Only differences between two `now()` calls are meaningful.
pub type MonoTime = Instant;

pub fn now() -> MonoTime {
    Instant::now()
}

/// Seconds elapsed between `earlier` and `later`, floored at 1 so that a
/// freshly created `Stat` never divides by zero.
pub fn elapsed_secs_at_least_one(earlier: MonoTime, later: MonoTime) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64().max(1.0)
}

/// Exponential backoff used by the collector thread to avoid busy-spinning
/// an empty event queue. Delays start near zero, double on every idle poll,
/// and are capped at `ceiling_ms`. A successful `consume` must call `reset`.
pub struct Backoff {
    current_ms: u64,
    ceiling_ms: u64,
}

impl Backoff {
    pub const DEFAULT_CEILING_MS: u64 = 1000;

    pub fn new() -> Self {
        Self::with_ceiling(Self::DEFAULT_CEILING_MS)
    }

    pub fn with_ceiling(ceiling_ms: u64) -> Self {
        Backoff { current_ms: 0, ceiling_ms }
    }

    /// Returns the next delay and advances the internal counter.
    pub fn next_ms(&mut self) -> u64 {
        let delay = self.current_ms;
        self.current_ms = if self.current_ms == 0 {
            1
        } else {
            (self.current_ms * 2).min(self.ceiling_ms)
        };
        delay
    }

    pub fn next(&mut self) -> Duration {
        Duration::from_millis(self.next_ms())
    }

    pub fn reset(&mut self) {
        self.current_ms = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
