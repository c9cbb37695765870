//! Hardware access boundary.
//!
//! Drivers never touch pins directly; they go through [`Hardware`], which the
//! sensor table owns and lends to the driver bank while it holds its lock.
//! [`SimulatedHardware`] stands in for the board in tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{BitesError, Result};

/// Largest value produced by the 12-bit analog converter.
pub const ADC_MAX: u16 = 4095;

/// Electrical configuration applied to a pin at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    InputPullup,
}

/// One raw register dump from the inertial unit (accelerometer, temperature,
/// gyroscope) in signed device counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawInertialFrame {
    pub accel: [i16; 3],
    pub temperature: i16,
    pub gyro: [i16; 3],
}

/// Board-level I/O used by the channel drivers.
pub trait Hardware: Send {
    fn configure_pin(&mut self, pin: u8, mode: PinMode);

    /// Reads the 12-bit analog converter on `pin`.
    fn analog_read(&mut self, pin: u8) -> u16;

    /// Reads the logic level on `pin` (`true` = HIGH).
    fn digital_read(&mut self, pin: u8) -> bool;

    /// Probes the inertial unit on its bus.
    fn inertial_connected(&mut self) -> bool;

    fn read_inertial(&mut self) -> Result<RawInertialFrame>;
}

#[derive(Debug, Default)]
struct Script<T: Copy> {
    queued: VecDeque<T>,
    hold: Option<T>,
}

impl<T: Copy> Script<T> {
    fn next(&mut self) -> Option<T> {
        if let Some(value) = self.queued.pop_front() {
            self.hold = Some(value);
        }
        self.hold
    }
}

#[derive(Debug)]
struct SimulatedState {
    pin_modes: HashMap<u8, PinMode>,
    analog: HashMap<u8, Script<u16>>,
    digital: HashMap<u8, Script<bool>>,
    inertial: Script<RawInertialFrame>,
    inertial_online: bool,
    analog_reads: u64,
}

impl Default for SimulatedState {
    fn default() -> Self {
        Self {
            pin_modes: HashMap::new(),
            analog: HashMap::new(),
            digital: HashMap::new(),
            inertial: Script::default(),
            inertial_online: true,
            analog_reads: 0,
        }
    }
}

/// In-memory board whose inputs are scripted through a
/// [`SimulatedHardwareHandle`].
///
/// Queued values are consumed one per read; once a queue drains the last
/// value is held. Unscripted analog pins read 0, unscripted digital pins
/// read HIGH (idle pull-up), and an unscripted inertial unit reports a
/// level device at rest (1 g on Z).
#[derive(Debug, Clone, Default)]
pub struct SimulatedHardware {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle that scripts this board from another thread.
    pub fn handle(&self) -> SimulatedHardwareHandle {
        SimulatedHardwareHandle {
            state: self.state.clone(),
        }
    }
}

impl Hardware for SimulatedHardware {
    fn configure_pin(&mut self, pin: u8, mode: PinMode) {
        self.state.lock().pin_modes.insert(pin, mode);
    }

    fn analog_read(&mut self, pin: u8) -> u16 {
        let mut state = self.state.lock();
        state.analog_reads += 1;
        state
            .analog
            .get_mut(&pin)
            .and_then(Script::next)
            .unwrap_or(0)
            .min(ADC_MAX)
    }

    fn digital_read(&mut self, pin: u8) -> bool {
        self.state
            .lock()
            .digital
            .get_mut(&pin)
            .and_then(Script::next)
            .unwrap_or(true)
    }

    fn inertial_connected(&mut self) -> bool {
        self.state.lock().inertial_online
    }

    fn read_inertial(&mut self) -> Result<RawInertialFrame> {
        let mut state = self.state.lock();
        if !state.inertial_online {
            return Err(BitesError::HardwareUnavailable(
                "inertial unit not responding".to_string(),
            ));
        }
        Ok(state.inertial.next().unwrap_or(RawInertialFrame {
            accel: [0, 0, 16384],
            temperature: 0,
            gyro: [0, 0, 0],
        }))
    }
}

/// Scripting handle for [`SimulatedHardware`].
#[derive(Debug, Clone)]
pub struct SimulatedHardwareHandle {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedHardwareHandle {
    /// Holds `pin` at `value` until the next scripted change.
    pub fn set_analog(&self, pin: u8, value: u16) {
        let mut state = self.state.lock();
        let script = state.analog.entry(pin).or_default();
        script.queued.clear();
        script.hold = Some(value);
    }

    /// Queues `values` to be returned by consecutive reads of `pin`.
    pub fn queue_analog(&self, pin: u8, values: impl IntoIterator<Item = u16>) {
        let mut state = self.state.lock();
        state
            .analog
            .entry(pin)
            .or_default()
            .queued
            .extend(values);
    }

    pub fn set_digital(&self, pin: u8, high: bool) {
        let mut state = self.state.lock();
        let script = state.digital.entry(pin).or_default();
        script.queued.clear();
        script.hold = Some(high);
    }

    pub fn queue_digital(&self, pin: u8, levels: impl IntoIterator<Item = bool>) {
        let mut state = self.state.lock();
        state
            .digital
            .entry(pin)
            .or_default()
            .queued
            .extend(levels);
    }

    pub fn set_inertial(&self, frame: RawInertialFrame) {
        let mut state = self.state.lock();
        state.inertial.queued.clear();
        state.inertial.hold = Some(frame);
    }

    pub fn queue_inertial(&self, frames: impl IntoIterator<Item = RawInertialFrame>) {
        self.state.lock().inertial.queued.extend(frames);
    }

    /// Simulates the inertial unit dropping off (or returning to) the bus.
    pub fn set_inertial_online(&self, online: bool) {
        self.state.lock().inertial_online = online;
    }

    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.state.lock().pin_modes.get(&pin).copied()
    }

    /// Total analog conversions performed so far.
    pub fn analog_reads(&self) -> u64 {
        self.state.lock().analog_reads
    }
}
