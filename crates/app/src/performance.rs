//! Scripted player for the simulated board.

use bites_core::drivers::Technology;
use bites_core::hal::{RawInertialFrame, SimulatedHardwareHandle};
use bites_core::instrument::ChannelSpec;

/// Raw level of a firmly struck piezo or pressed key.
const STRIKE_LEVEL: u16 = 3000;

const REST: RawInertialFrame = RawInertialFrame {
    accel: [0, 0, 16384],
    temperature: 0,
    gyro: [0, 0, 0],
};

/// Fast downward sweep: about 2.2 g and 150 deg/s.
const STRUM: RawInertialFrame = RawInertialFrame {
    accel: [20000, 25000, 16384],
    temperature: 0,
    gyro: [0, 0, 19650],
};

/// Walks the instrument's channels one beat at a time.
#[derive(Debug)]
pub struct Performance {
    hardware: SimulatedHardwareHandle,
    channels: Vec<ChannelSpec>,
    beat: usize,
    held: Option<ChannelSpec>,
}

impl Performance {
    pub fn new(hardware: SimulatedHardwareHandle, layout: Vec<ChannelSpec>) -> Self {
        let channels = layout
            .into_iter()
            .filter(|spec| spec.technology != Technology::Inertial)
            .collect();
        hardware.set_inertial(REST);
        Self {
            hardware,
            channels,
            beat: 0,
            held: None,
        }
    }

    pub fn beats(&self) -> usize {
        self.beat
    }

    /// Strikes the next channel; every fourth beat is also a strum.
    pub fn strike(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        let spec = self.channels[self.beat % self.channels.len()];
        match spec.technology {
            Technology::BreakBeam => self.hardware.set_digital(spec.pin, false),
            _ => self.hardware.set_analog(spec.pin, STRIKE_LEVEL),
        }
        if self.beat % 4 == 0 {
            self.hardware.set_inertial(STRUM);
        }
        self.held = Some(spec);
        self.beat += 1;
    }

    /// Lets go of whatever the last strike held.
    pub fn release(&mut self) {
        if let Some(spec) = self.held.take() {
            match spec.technology {
                Technology::BreakBeam => self.hardware.set_digital(spec.pin, true),
                _ => self.hardware.set_analog(spec.pin, 0),
            }
        }
        self.hardware.set_inertial(REST);
    }
}
