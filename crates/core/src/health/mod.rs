//! Liveness watchdog and periodic health checks run by housekeeping.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::scheduler::{SchedulerStats, WorkerRole, WorkerStats};
use crate::table::SensorTable;

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Share of skipped polls, per check interval, above which a warning is logged.
pub const SKIPPED_POLL_WARN_RATIO: f64 = 0.01;

/// Software watchdog. Housekeeping feeds it; anything may check it.
pub struct Watchdog {
    clock: SharedClock,
    timeout: Duration,
    last_feed_us: AtomicU64,
    enabled: AtomicBool,
}

impl Watchdog {
    pub fn new(timeout: Duration, clock: SharedClock) -> Self {
        let now = clock.now().as_micros() as u64;
        info!(timeout_ms = timeout.as_millis() as u64, "watchdog armed");
        Self {
            clock,
            timeout,
            last_feed_us: AtomicU64::new(now),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn feed(&self) {
        if self.is_enabled() {
            self.last_feed_us
                .store(self.clock.now().as_micros() as u64, Ordering::Release);
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            warn!("watchdog disabled");
        }
    }

    /// Re-arms the watchdog, counting from now.
    pub fn enable(&self) {
        self.last_feed_us
            .store(self.clock.now().as_micros() as u64, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn since_feed(&self) -> Duration {
        let last = Duration::from_micros(self.last_feed_us.load(Ordering::Acquire));
        self.clock.now().saturating_sub(last)
    }

    /// Enabled and not fed within the timeout.
    pub fn is_expired(&self) -> bool {
        self.is_enabled() && self.since_feed() > self.timeout
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.timeout)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Voice pool occupancy, published by the audio worker.
#[derive(Debug, Default)]
pub struct VoiceGauge {
    active: AtomicUsize,
    capacity: AtomicUsize,
}

impl VoiceGauge {
    pub fn record(&self, active: usize, capacity: usize) {
        self.active.store(active, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub workers: Vec<(WorkerRole, WorkerStats)>,
    pub completed_polls: u64,
    pub skipped_polls: u64,
    pub voices_active: usize,
    pub voice_capacity: usize,
    pub watchdog_expired: bool,
    /// Number of warnings raised by this check.
    pub warnings: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings == 0
    }
}

/// Compares counters against the previous check and warns on regressions.
#[derive(Debug)]
pub struct HealthMonitor {
    stats: Arc<SchedulerStats>,
    table: Arc<SensorTable>,
    voices: Arc<VoiceGauge>,
    watchdog: Arc<Watchdog>,
    previous: Option<HealthReport>,
}

impl HealthMonitor {
    pub fn new(
        stats: Arc<SchedulerStats>,
        table: Arc<SensorTable>,
        voices: Arc<VoiceGauge>,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        Self {
            stats,
            table,
            voices,
            watchdog,
            previous: None,
        }
    }

    pub fn check(&mut self) -> HealthReport {
        let mut report = HealthReport {
            workers: self.stats.all(),
            completed_polls: self.table.completed_polls(),
            skipped_polls: self.table.skipped_polls(),
            voices_active: self.voices.active(),
            voice_capacity: self.voices.capacity(),
            watchdog_expired: self.watchdog.is_expired(),
            warnings: 0,
        };

        let (prev_workers, prev_completed, prev_skipped) = match &self.previous {
            Some(previous) => (
                previous.workers.clone(),
                previous.completed_polls,
                previous.skipped_polls,
            ),
            None => (Vec::new(), 0, 0),
        };

        for (role, stats) in &report.workers {
            let before = prev_workers
                .iter()
                .find(|(r, _)| r == role)
                .map_or(0, |(_, s)| s.overruns);
            if stats.overruns > before {
                warn!(
                    worker = %role,
                    new_overruns = stats.overruns - before,
                    total = stats.overruns,
                    "worker overran its period"
                );
                report.warnings += 1;
            }
        }

        let completed = report.completed_polls.saturating_sub(prev_completed);
        let skipped = report.skipped_polls.saturating_sub(prev_skipped);
        let attempted = completed + skipped;
        if attempted > 0 && skipped as f64 / attempted as f64 > SKIPPED_POLL_WARN_RATIO {
            warn!(skipped, attempted, "sensor polls skipped under contention");
            report.warnings += 1;
        }

        if report.voice_capacity > 0 && report.voices_active >= report.voice_capacity {
            warn!(active = report.voices_active, "voice pool full");
            report.warnings += 1;
        }

        if report.watchdog_expired {
            warn!(
                since_feed_ms = self.watchdog.since_feed().as_millis() as u64,
                "watchdog expired"
            );
            report.warnings += 1;
        }

        self.previous = Some(report.clone());
        report
    }
}
