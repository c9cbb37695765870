//! Fixed-capacity registry of sensing channels and their latest samples.
//!
//! Everything lives behind one table-wide lock: the channel entries, the
//! driver bank and the hardware the drivers read from. [`SensorTable::poll`]
//! updates every sample while holding that lock for the whole cycle, so a
//! reader either sees the sample set from before a poll or from after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::drivers::{
    CalibrationPlan, ChannelDescriptor, ChannelId, DriverBank, InertialReading, Technology,
};
use crate::fusion::InertialSource;
use crate::hal::Hardware;
use crate::{BitesError, Result};

/// Maximum number of channels across all technologies.
pub const TABLE_CAPACITY: usize = 16;

/// Channel id carried by the sample returned for unregistered ids.
pub const SENTINEL_CHANNEL: ChannelId = 0xFF;

/// Longest the sensing worker waits for the lock before skipping a cycle.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

/// Latest observation for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub channel_id: ChannelId,
    pub value: f32,
    pub velocity: f32,
    /// Clock time of the poll that captured the sample.
    pub timestamp: Duration,
    pub triggered: bool,
    pub last_trigger_time: Option<Duration>,
}

impl SensorSample {
    /// Zeroed sample for a freshly registered channel.
    pub fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            value: 0.0,
            velocity: 0.0,
            timestamp: Duration::ZERO,
            triggered: false,
            last_trigger_time: None,
        }
    }

    pub fn sentinel() -> Self {
        Self::empty(SENTINEL_CHANNEL)
    }

    pub fn is_sentinel(&self) -> bool {
        self.channel_id == SENTINEL_CHANNEL
    }
}

/// Result of one [`SensorTable::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(PollSummary),
    /// The lock was not acquired in time; no sample was touched.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub timestamp: Duration,
    pub channels: usize,
    /// Bit `n` set when channel `n` triggered in this cycle.
    pub triggered_mask: u16,
}

impl PollSummary {
    pub fn any_triggered(&self) -> bool {
        self.triggered_mask != 0
    }

    pub fn triggered(&self) -> impl Iterator<Item = ChannelId> + '_ {
        (0..TABLE_CAPACITY as u8).filter(move |id| self.triggered_mask & (1 << id) != 0)
    }
}

/// Detects triggers accepted since the last look at a channel.
///
/// Consumers running slower than the poll cycle would miss the one-poll
/// `triggered` pulse; a changed `last_trigger_time` marks a new trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerTracker {
    seen: [Option<Duration>; TABLE_CAPACITY],
}

impl TriggerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `sample` carries a trigger this tracker has not reported yet.
    pub fn fresh(&mut self, sample: &SensorSample) -> bool {
        let Some(seen) = self.seen.get_mut(usize::from(sample.channel_id)) else {
            return false;
        };
        match sample.last_trigger_time {
            Some(time) if *seen != Some(time) => {
                *seen = Some(time);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.seen = [None; TABLE_CAPACITY];
    }
}

#[derive(Debug, Clone)]
struct TableEntry {
    technology: Technology,
    sample: SensorSample,
}

struct TableState {
    entries: Vec<TableEntry>,
    drivers: DriverBank,
    hardware: Box<dyn Hardware>,
    inertial: Option<InertialReading>,
}

impl TableState {
    fn position(&self, id: ChannelId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.sample.channel_id == id)
    }

    fn technology(&self, id: ChannelId) -> Option<Technology> {
        self.position(id).map(|index| self.entries[index].technology)
    }
}

/// Shared sensor registry. Wrap it in an `Arc` to hand it to workers.
pub struct SensorTable {
    state: Mutex<TableState>,
    clock: SharedClock,
    lock_timeout: Duration,
    calibration: Mutex<CalibrationPlan>,
    completed_polls: AtomicU64,
    skipped_polls: AtomicU64,
}

impl SensorTable {
    pub fn new(hardware: Box<dyn Hardware>, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: Vec::with_capacity(TABLE_CAPACITY),
                drivers: DriverBank::new(),
                hardware,
                inertial: None,
            }),
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            calibration: Mutex::new(CalibrationPlan::default()),
            completed_polls: AtomicU64::new(0),
            skipped_polls: AtomicU64::new(0),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_calibration_plan(self, plan: CalibrationPlan) -> Self {
        *self.calibration.lock() = plan;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Registers a channel and configures its hardware input through the
    /// driver for `technology`.
    pub fn register_channel(&self, technology: Technology, id: ChannelId, pin: u8) -> Result<()> {
        if usize::from(id) >= TABLE_CAPACITY {
            warn!(channel = id, "channel id out of range");
            return Err(BitesError::InvalidChannel(id));
        }

        let mut state = self.state.lock();
        if state.position(id).is_some() {
            return Err(BitesError::DuplicateChannel(id));
        }
        if state.entries.len() >= TABLE_CAPACITY {
            return Err(BitesError::CapacityExceeded {
                what: "sensor table",
                capacity: TABLE_CAPACITY,
            });
        }

        let TableState {
            entries,
            drivers,
            hardware,
            ..
        } = &mut *state;
        drivers
            .driver_mut(technology)
            .register(hardware.as_mut(), id, pin)?;
        entries.push(TableEntry {
            technology,
            sample: SensorSample::empty(id),
        });

        info!(channel = id, pin, %technology, "channel registered");
        Ok(())
    }

    /// Removes a channel. The remaining entries may be reordered.
    pub fn unregister_channel(&self, id: ChannelId) -> Result<()> {
        let mut state = self.state.lock();
        let index = state.position(id).ok_or(BitesError::InvalidChannel(id))?;

        let technology = state.entries[index].technology;
        state.drivers.driver_mut(technology).unregister(id);
        state.entries.swap_remove(index);
        if technology == Technology::Inertial {
            state.inertial = None;
        }

        info!(channel = id, %technology, "channel unregistered");
        Ok(())
    }

    /// Drops every channel.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let TableState {
            entries,
            drivers,
            inertial,
            ..
        } = &mut *state;
        for entry in entries.drain(..) {
            drivers
                .driver_mut(entry.technology)
                .unregister(entry.sample.channel_id);
        }
        *inertial = None;
        info!("sensor table reset");
    }

    /// Reads every registered channel and rewrites its sample.
    ///
    /// Skips the whole cycle if the lock cannot be taken within the
    /// configured timeout.
    pub fn poll(&self) -> PollOutcome {
        let Some(mut state) = self.state.try_lock_for(self.lock_timeout) else {
            let skipped = self.skipped_polls.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(skipped, "sensor table busy, poll skipped");
            return PollOutcome::Skipped;
        };

        let now = self.clock.now();
        let mut summary = PollSummary {
            timestamp: now,
            channels: state.entries.len(),
            triggered_mask: 0,
        };

        let TableState {
            entries,
            drivers,
            hardware,
            inertial,
        } = &mut *state;
        let mut saw_inertial = false;
        for entry in entries.iter_mut() {
            let id = entry.sample.channel_id;
            let reading = drivers
                .driver_mut(entry.technology)
                .sample(hardware.as_mut(), id, now);

            entry.sample = SensorSample {
                channel_id: id,
                value: reading.value,
                velocity: reading.velocity,
                timestamp: now,
                triggered: reading.triggered,
                last_trigger_time: reading.last_trigger_time,
            };
            if reading.triggered {
                summary.triggered_mask |= 1 << id;
            }
            saw_inertial |= entry.technology == Technology::Inertial;
        }
        if saw_inertial {
            *inertial = drivers.inertial().latest();
        }

        drop(state);
        self.completed_polls.fetch_add(1, Ordering::Relaxed);
        PollOutcome::Completed(summary)
    }

    /// Latest sample for `id`, or the sentinel sample if it is not registered.
    pub fn get_sample(&self, id: ChannelId) -> SensorSample {
        let state = self.state.lock();
        match state.position(id) {
            Some(index) => state.entries[index].sample,
            None => {
                warn!(channel = id, "sample requested for unknown channel");
                SensorSample::sentinel()
            }
        }
    }

    pub fn is_triggered(&self, id: ChannelId) -> bool {
        self.get_sample(id).triggered
    }

    /// Every sample, captured under a single lock acquisition.
    pub fn snapshot(&self) -> Vec<SensorSample> {
        let state = self.state.lock();
        state.entries.iter().map(|entry| entry.sample).collect()
    }

    /// Samples of every channel driven by `technology`, under one lock.
    pub fn samples_of(&self, technology: Technology) -> Vec<SensorSample> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|entry| entry.technology == technology)
            .map(|entry| entry.sample)
            .collect()
    }

    /// Calibrates every registered channel in turn.
    ///
    /// Blocks the table for the whole run, so polls issued meanwhile are
    /// skipped. A channel that fails is logged and left uncalibrated; the
    /// first failure is returned once every channel has been attempted.
    pub fn calibrate_all(&self) -> Result<()> {
        let plan = *self.calibration.lock();
        let mut state = self.state.lock();
        let TableState {
            entries,
            drivers,
            hardware,
            ..
        } = &mut *state;

        info!(channels = entries.len(), samples = plan.samples, "calibrating sensor table");
        let mut first_error = None;
        for entry in entries.iter() {
            let id = entry.sample.channel_id;
            let result = drivers.driver_mut(entry.technology).calibrate(
                hardware.as_mut(),
                self.clock.as_ref(),
                id,
                plan,
            );
            if let Err(err) = result {
                warn!(channel = id, technology = %entry.technology, error = %err, "calibration failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn set_calibration_plan(&self, plan: CalibrationPlan) {
        *self.calibration.lock() = plan;
    }

    pub fn calibration_plan(&self) -> CalibrationPlan {
        *self.calibration.lock()
    }

    pub fn set_threshold(&self, id: ChannelId, threshold: f32) {
        self.with_driver(id, |drivers, technology| {
            drivers.driver_mut(technology).set_threshold(id, threshold)
        });
    }

    pub fn threshold(&self, id: ChannelId) -> f32 {
        self.with_driver(id, |drivers, technology| {
            drivers.driver(technology).threshold(id)
        })
        .unwrap_or(0.0)
    }

    pub fn set_baseline(&self, id: ChannelId, baseline: f32) {
        self.with_driver(id, |drivers, technology| {
            drivers.driver_mut(technology).set_baseline(id, baseline)
        });
    }

    pub fn set_debounce_time(&self, id: ChannelId, window: Duration) {
        self.with_driver(id, |drivers, technology| {
            drivers.driver_mut(technology).set_debounce_time(id, window)
        });
    }

    pub fn descriptor(&self, id: ChannelId) -> Option<ChannelDescriptor> {
        let state = self.state.lock();
        let technology = state.technology(id)?;
        state.drivers.driver(technology).descriptor(id)
    }

    /// Descriptors of every registered channel, in table order.
    pub fn descriptors(&self) -> Vec<ChannelDescriptor> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter_map(|entry| {
                state
                    .drivers
                    .driver(entry.technology)
                    .descriptor(entry.sample.channel_id)
            })
            .collect()
    }

    pub fn technology(&self, id: ChannelId) -> Option<Technology> {
        self.state.lock().technology(id)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|entry| entry.sample.channel_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inertial reading captured by the most recent completed poll.
    pub fn inertial_reading(&self) -> Option<InertialReading> {
        self.state.lock().inertial
    }

    pub fn completed_polls(&self) -> u64 {
        self.completed_polls.load(Ordering::Relaxed)
    }

    pub fn skipped_polls(&self) -> u64 {
        self.skipped_polls.load(Ordering::Relaxed)
    }

    fn with_driver<T>(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut DriverBank, Technology) -> T,
    ) -> Option<T> {
        let mut state = self.state.lock();
        match state.technology(id) {
            Some(technology) => Some(f(&mut state.drivers, technology)),
            None => {
                warn!(channel = id, "unknown channel");
                None
            }
        }
    }

    #[cfg(test)]
    fn lock_for_test(&self) -> parking_lot::MutexGuard<'_, TableState> {
        self.state.lock()
    }
}

impl InertialSource for SensorTable {
    fn latest_inertial(&self) -> Option<InertialReading> {
        self.inertial_reading()
    }
}

impl std::fmt::Debug for SensorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorTable")
            .field("lock_timeout", &self.lock_timeout)
            .field("completed_polls", &self.completed_polls())
            .field("skipped_polls", &self.skipped_polls())
            .finish_non_exhaustive()
    }
}
