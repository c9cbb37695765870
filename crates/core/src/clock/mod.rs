use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source shared by drivers, the sensor table and the voice
/// pool. Times are offsets from the clock's own origin.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock origin.
    fn now(&self) -> Duration;

    /// Blocks the caller for `duration`. Used by calibration between samples.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock for deterministic tests and offline runs.
///
/// Clones share the same time. `sleep` advances time instead of blocking.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock that starts at `start`.
    pub fn starting_at(start: Duration) -> Self {
        let clock = Self::new();
        clock.set(start);
        clock
    }

    pub fn advance(&self, delta: Duration) {
        self.micros
            .fetch_add(delta.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, time: Duration) {
        self.micros.store(time.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Shared clock handle passed to every component.
pub type SharedClock = Arc<dyn Clock>;
