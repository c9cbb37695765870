//! Channel drivers, one per sensing technology.
//!
//! Every driver keeps a fixed arena of [`DRIVER_CAPACITY`] slots keyed by
//! channel id and implements [`ChannelDriver`]. Operations given an unknown
//! channel id degrade to neutral values and log a warning; only
//! registration and calibration report failures.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::hal::Hardware;
use crate::Result;

pub mod analog;
pub mod break_beam;
pub mod debounce;
pub mod inertial;

pub use analog::{AnalogDriver, AnalogProfile, AnalogScale};
pub use break_beam::BreakBeamDriver;
pub use debounce::Debouncer;
pub use inertial::{InertialDriver, InertialReading};

/// Identifier of one sensing channel, unique across the sensor table.
pub type ChannelId = u8;

/// Maximum number of channels a single technology driver can hold.
pub const DRIVER_CAPACITY: usize = 8;

/// Sensing technology behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    /// Piezo contact sensor (strings, pads).
    Contact,
    /// Infrared break-beam with a binary output.
    BreakBeam,
    /// Force-sensitive resistor.
    Pressure,
    Flex,
    /// Accelerometer/gyroscope unit.
    Inertial,
}

impl Technology {
    pub const ALL: [Technology; 5] = [
        Technology::Contact,
        Technology::BreakBeam,
        Technology::Pressure,
        Technology::Flex,
        Technology::Inertial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Technology::Contact => "contact",
            Technology::BreakBeam => "break_beam",
            Technology::Pressure => "pressure",
            Technology::Flex => "flex",
            Technology::Inertial => "inertial",
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and calibration of one physical channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub channel_id: ChannelId,
    pub technology: Technology,
    pub hardware_pin: u8,
    /// Calibrated rest value. Units depend on the technology; flex channels
    /// store the raw converter count the deflection is measured from.
    pub baseline: f32,
    pub threshold: f32,
    pub debounce_window: Duration,
}

/// How many samples calibration averages and how far apart they are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPlan {
    pub samples: u32,
    pub interval: Duration,
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self {
            samples: 100,
            interval: Duration::from_millis(10),
        }
    }
}

/// Result of one read-and-evaluate pass over a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub value: f32,
    pub velocity: f32,
    pub triggered: bool,
    pub last_trigger_time: Option<Duration>,
}

/// Contract shared by all technology drivers.
pub trait ChannelDriver: Send {
    fn technology(&self) -> Technology;

    /// Number of channels currently registered with this driver.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: ChannelId) -> bool;

    /// Claims a slot for `id` and configures its pin.
    fn register(&mut self, hw: &mut dyn Hardware, id: ChannelId, pin: u8) -> Result<()>;

    /// Releases the slot held by `id`. Returns `false` if it was not registered.
    fn unregister(&mut self, id: ChannelId) -> bool;

    /// Samples the channel at rest and derives a new baseline and threshold.
    fn calibrate(
        &mut self,
        hw: &mut dyn Hardware,
        clock: &dyn Clock,
        id: ChannelId,
        plan: CalibrationPlan,
    ) -> Result<()>;

    /// Converts the current hardware reading to calibrated units and updates
    /// the channel velocity.
    fn read(&mut self, hw: &mut dyn Hardware, id: ChannelId, now: Duration) -> f32;

    fn velocity(&self, id: ChannelId) -> f32;

    /// Applies the trigger condition and debounce window to an already read
    /// value. Accepting a trigger records `now` as the last trigger time.
    fn evaluate(&mut self, id: ChannelId, value: f32, now: Duration) -> bool;

    fn last_trigger_time(&self, id: ChannelId) -> Option<Duration>;

    fn set_threshold(&mut self, id: ChannelId, threshold: f32);

    fn threshold(&self, id: ChannelId) -> f32;

    fn set_baseline(&mut self, id: ChannelId, baseline: f32);

    fn set_debounce_time(&mut self, id: ChannelId, window: Duration);

    fn descriptor(&self, id: ChannelId) -> Option<ChannelDescriptor>;

    /// Reads the channel and reports whether a debounced trigger fired.
    fn is_triggered(&mut self, hw: &mut dyn Hardware, id: ChannelId, now: Duration) -> bool {
        let value = self.read(hw, id, now);
        self.evaluate(id, value, now)
    }

    /// One read followed by one trigger evaluation, as done by the poll cycle.
    fn sample(&mut self, hw: &mut dyn Hardware, id: ChannelId, now: Duration) -> Reading {
        let value = self.read(hw, id, now);
        let triggered = self.evaluate(id, value, now);
        Reading {
            value,
            velocity: self.velocity(id),
            triggered,
            last_trigger_time: self.last_trigger_time(id),
        }
    }
}

/// The five drivers, addressed by technology.
#[derive(Debug)]
pub struct DriverBank {
    contact: AnalogDriver,
    pressure: AnalogDriver,
    flex: AnalogDriver,
    break_beam: BreakBeamDriver,
    inertial: InertialDriver,
}

impl DriverBank {
    pub fn new() -> Self {
        Self {
            contact: AnalogDriver::new(AnalogProfile::CONTACT),
            pressure: AnalogDriver::new(AnalogProfile::PRESSURE),
            flex: AnalogDriver::new(AnalogProfile::FLEX),
            break_beam: BreakBeamDriver::new(),
            inertial: InertialDriver::new(),
        }
    }

    pub fn driver(&self, technology: Technology) -> &dyn ChannelDriver {
        match technology {
            Technology::Contact => &self.contact,
            Technology::Pressure => &self.pressure,
            Technology::Flex => &self.flex,
            Technology::BreakBeam => &self.break_beam,
            Technology::Inertial => &self.inertial,
        }
    }

    pub fn driver_mut(&mut self, technology: Technology) -> &mut dyn ChannelDriver {
        match technology {
            Technology::Contact => &mut self.contact,
            Technology::Pressure => &mut self.pressure,
            Technology::Flex => &mut self.flex,
            Technology::BreakBeam => &mut self.break_beam,
            Technology::Inertial => &mut self.inertial,
        }
    }

    pub fn inertial(&self) -> &InertialDriver {
        &self.inertial
    }
}

impl Default for DriverBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimulatedHardware;

    #[test]
    fn bank_routes_by_technology() {
        let mut bank = DriverBank::new();
        let mut board = SimulatedHardware::new();

        for technology in Technology::ALL {
            assert_eq!(bank.driver(technology).technology(), technology);
        }

        bank.driver_mut(Technology::Pressure)
            .register(&mut board, 4, 20)
            .unwrap();
        assert!(bank.driver(Technology::Pressure).contains(4));
        assert!(!bank.driver(Technology::Contact).contains(4));
    }

    #[test]
    fn technology_names_round_trip_through_serde() {
        let json = serde_json::to_string(&Technology::BreakBeam).unwrap();
        assert_eq!(json, "\"break_beam\"");
        let parsed: Technology = serde_json::from_str("\"flex\"").unwrap();
        assert_eq!(parsed, Technology::Flex);
    }
}
