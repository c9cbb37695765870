use std::time::Duration;

use tracing::{info, warn};

use super::{
    CalibrationPlan, ChannelDescriptor, ChannelDriver, ChannelId, Debouncer, Technology,
    DRIVER_CAPACITY,
};
use crate::clock::Clock;
use crate::hal::{Hardware, PinMode, ADC_MAX};
use crate::{BitesError, Result};

/// How raw converter counts map to calibrated units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnalogScale {
    /// Millivolts against the given reference voltage.
    Millivolts { reference_volts: f32 },
    /// Volts against the given reference voltage.
    Volts { reference_volts: f32 },
    /// Deflection from the calibrated raw baseline, normalised to [0, 1].
    Deflection,
}

impl AnalogScale {
    pub fn convert(self, raw: f32, baseline: f32) -> f32 {
        let full_scale = ADC_MAX as f32;
        match self {
            AnalogScale::Millivolts { reference_volts } => raw / full_scale * reference_volts * 1000.0,
            AnalogScale::Volts { reference_volts } => raw / full_scale * reference_volts,
            AnalogScale::Deflection => (raw - baseline).abs() / full_scale,
        }
    }
}

/// Per-technology constants for threshold-crossing drivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogProfile {
    pub technology: Technology,
    pub name: &'static str,
    pub scale: AnalogScale,
    pub default_threshold: f32,
    pub default_debounce: Duration,
    /// Added to the calibrated baseline to obtain the new threshold.
    pub calibration_margin: f32,
}

impl AnalogProfile {
    pub const CONTACT: AnalogProfile = AnalogProfile {
        technology: Technology::Contact,
        name: "contact driver",
        scale: AnalogScale::Millivolts {
            reference_volts: 3.3,
        },
        default_threshold: 100.0,
        default_debounce: Duration::from_millis(50),
        calibration_margin: 50.0,
    };

    pub const PRESSURE: AnalogProfile = AnalogProfile {
        technology: Technology::Pressure,
        name: "pressure driver",
        scale: AnalogScale::Volts {
            reference_volts: 5.0,
        },
        default_threshold: 0.1,
        default_debounce: Duration::from_millis(20),
        calibration_margin: 0.1,
    };

    pub const FLEX: AnalogProfile = AnalogProfile {
        technology: Technology::Flex,
        name: "flex driver",
        scale: AnalogScale::Deflection,
        default_threshold: 0.5,
        default_debounce: Duration::from_millis(30),
        calibration_margin: 0.15,
    };
}

#[derive(Debug, Clone)]
struct AnalogSlot {
    id: ChannelId,
    pin: u8,
    baseline: f32,
    threshold: f32,
    last_value: f32,
    velocity: f32,
    debouncer: Debouncer,
}

/// Driver for contact, pressure and flex channels: a value above the
/// threshold, outside the debounce window, is a trigger.
#[derive(Debug)]
pub struct AnalogDriver {
    profile: AnalogProfile,
    slots: [Option<AnalogSlot>; DRIVER_CAPACITY],
}

impl AnalogDriver {
    pub fn new(profile: AnalogProfile) -> Self {
        Self {
            profile,
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn profile(&self) -> &AnalogProfile {
        &self.profile
    }

    fn slot(&self, id: ChannelId) -> Option<&AnalogSlot> {
        self.slots.iter().flatten().find(|slot| slot.id == id)
    }

    fn slot_mut(&mut self, id: ChannelId) -> Option<&mut AnalogSlot> {
        let technology = self.profile.technology;
        let slot = self.slots.iter_mut().flatten().find(|slot| slot.id == id);
        if slot.is_none() {
            warn!(channel = id, %technology, "unknown channel");
        }
        slot
    }
}

impl ChannelDriver for AnalogDriver {
    fn technology(&self) -> Technology {
        self.profile.technology
    }

    fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn contains(&self, id: ChannelId) -> bool {
        self.slot(id).is_some()
    }

    fn register(&mut self, hw: &mut dyn Hardware, id: ChannelId, pin: u8) -> Result<()> {
        if self.contains(id) {
            return Err(BitesError::DuplicateChannel(id));
        }

        let free = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(BitesError::CapacityExceeded {
                what: self.profile.name,
                capacity: DRIVER_CAPACITY,
            })?;

        hw.configure_pin(pin, PinMode::Input);
        *free = Some(AnalogSlot {
            id,
            pin,
            baseline: 0.0,
            threshold: self.profile.default_threshold,
            last_value: 0.0,
            velocity: 0.0,
            debouncer: Debouncer::new(self.profile.default_debounce),
        });

        info!(channel = id, pin, technology = %self.profile.technology, "channel initialised");
        Ok(())
    }

    fn unregister(&mut self, id: ChannelId) -> bool {
        match self.slots.iter_mut().find(|slot| matches!(slot, Some(s) if s.id == id)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    fn calibrate(
        &mut self,
        hw: &mut dyn Hardware,
        clock: &dyn Clock,
        id: ChannelId,
        plan: CalibrationPlan,
    ) -> Result<()> {
        let profile = self.profile;
        let slot = self.slot_mut(id).ok_or(BitesError::InvalidChannel(id))?;

        let samples = plan.samples.max(1);
        let mut sum = 0.0f64;
        for _ in 0..samples {
            sum += f64::from(hw.analog_read(slot.pin));
            clock.sleep(plan.interval);
        }
        let mean_raw = (sum / f64::from(samples)) as f32;

        match profile.scale {
            AnalogScale::Deflection => {
                slot.baseline = mean_raw;
                slot.threshold = profile.calibration_margin;
            }
            scale => {
                slot.baseline = scale.convert(mean_raw, 0.0);
                slot.threshold = slot.baseline + profile.calibration_margin;
            }
        }
        slot.last_value = 0.0;
        slot.velocity = 0.0;

        info!(
            channel = id,
            technology = %profile.technology,
            baseline = slot.baseline,
            threshold = slot.threshold,
            "channel calibrated"
        );
        Ok(())
    }

    fn read(&mut self, hw: &mut dyn Hardware, id: ChannelId, _now: Duration) -> f32 {
        let scale = self.profile.scale;
        let Some(slot) = self.slot_mut(id) else {
            return 0.0;
        };

        let raw = f32::from(hw.analog_read(slot.pin));
        let value = scale.convert(raw, slot.baseline);
        slot.velocity = (value - slot.last_value).abs();
        slot.last_value = value;
        value
    }

    fn velocity(&self, id: ChannelId) -> f32 {
        self.slot(id).map(|slot| slot.velocity).unwrap_or(0.0)
    }

    fn evaluate(&mut self, id: ChannelId, value: f32, now: Duration) -> bool {
        match self.slot_mut(id) {
            Some(slot) => slot.debouncer.accept(value > slot.threshold, now),
            None => false,
        }
    }

    fn last_trigger_time(&self, id: ChannelId) -> Option<Duration> {
        self.slot(id).and_then(|slot| slot.debouncer.last_accepted())
    }

    fn set_threshold(&mut self, id: ChannelId, threshold: f32) {
        if let Some(slot) = self.slot_mut(id) {
            slot.threshold = threshold;
        }
    }

    fn threshold(&self, id: ChannelId) -> f32 {
        self.slot(id).map(|slot| slot.threshold).unwrap_or(0.0)
    }

    fn set_baseline(&mut self, id: ChannelId, baseline: f32) {
        if let Some(slot) = self.slot_mut(id) {
            slot.baseline = baseline;
        }
    }

    fn set_debounce_time(&mut self, id: ChannelId, window: Duration) {
        if let Some(slot) = self.slot_mut(id) {
            slot.debouncer.set_window(window);
        }
    }

    fn descriptor(&self, id: ChannelId) -> Option<ChannelDescriptor> {
        self.slot(id).map(|slot| ChannelDescriptor {
            channel_id: slot.id,
            technology: self.profile.technology,
            hardware_pin: slot.pin,
            baseline: slot.baseline,
            threshold: slot.threshold,
            debounce_window: slot.debouncer.window(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hal::SimulatedHardware;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    /// Raw count that converts to `millivolts` on a contact channel.
    fn contact_raw(millivolts: f32) -> u16 {
        (millivolts / 3300.0 * ADC_MAX as f32).round() as u16
    }

    #[test]
    fn contact_scenario_respects_debounce_window() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = AnalogDriver::new(AnalogProfile::CONTACT);
        driver.register(&mut board, 0, 14).unwrap();
        driver.set_threshold(0, 100.0);
        driver.set_debounce_time(0, ms(50));

        let readings = [(0, 50.0), (10, 150.0), (20, 150.0), (30, 150.0), (60, 150.0)];
        let expected = [false, true, false, false, true];

        for ((t, millivolts), expected) in readings.into_iter().zip(expected) {
            handle.set_analog(14, contact_raw(millivolts));
            assert_eq!(
                driver.is_triggered(&mut board, 0, ms(t)),
                expected,
                "reading at t={t}ms"
            );
        }
        assert_eq!(driver.last_trigger_time(0), Some(ms(60)));
    }

    #[test]
    fn read_converts_and_tracks_velocity() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = AnalogDriver::new(AnalogProfile::PRESSURE);
        driver.register(&mut board, 2, 21).unwrap();

        handle.set_analog(21, ADC_MAX);
        let first = driver.read(&mut board, 2, ms(0));
        assert!((first - 5.0).abs() < 1e-4);
        assert!((driver.velocity(2) - 5.0).abs() < 1e-4);

        handle.set_analog(21, 0);
        let second = driver.read(&mut board, 2, ms(1));
        assert_eq!(second, 0.0);
        assert!((driver.velocity(2) - 5.0).abs() < 1e-4);
    }

    #[test]
    fn register_rejects_duplicates_and_overflow() {
        let mut board = SimulatedHardware::new();
        let mut driver = AnalogDriver::new(AnalogProfile::CONTACT);

        for id in 0..DRIVER_CAPACITY as u8 {
            driver.register(&mut board, id, id + 10).unwrap();
        }
        assert!(matches!(
            driver.register(&mut board, 0, 30),
            Err(BitesError::DuplicateChannel(0))
        ));
        assert!(matches!(
            driver.register(&mut board, 12, 30),
            Err(BitesError::CapacityExceeded { .. })
        ));

        assert!(driver.unregister(3));
        driver.register(&mut board, 12, 30).unwrap();
        assert_eq!(driver.len(), DRIVER_CAPACITY);
    }

    #[test]
    fn unknown_channels_return_neutral_values() {
        let mut board = SimulatedHardware::new();
        let mut driver = AnalogDriver::new(AnalogProfile::FLEX);

        assert_eq!(driver.read(&mut board, 9, ms(0)), 0.0);
        assert!(!driver.is_triggered(&mut board, 9, ms(0)));
        assert_eq!(driver.threshold(9), 0.0);
        assert_eq!(driver.velocity(9), 0.0);
        assert!(driver.descriptor(9).is_none());
        driver.set_threshold(9, 1.0);
    }

    #[test]
    fn contact_calibration_adds_margin_to_mean_baseline() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let clock = ManualClock::new();
        let mut driver = AnalogDriver::new(AnalogProfile::CONTACT);
        driver.register(&mut board, 1, 15).unwrap();

        handle.queue_analog(15, [1000, 1200, 1100, 1100]);
        let plan = CalibrationPlan {
            samples: 4,
            interval: ms(10),
        };
        driver.calibrate(&mut board, &clock, 1, plan).unwrap();

        let descriptor = driver.descriptor(1).unwrap();
        let expected_baseline = 1100.0 / ADC_MAX as f32 * 3300.0;
        assert!((descriptor.baseline - expected_baseline).abs() < 1e-2);
        assert!((descriptor.threshold - (expected_baseline + 50.0)).abs() < 1e-2);
        assert_eq!(clock.now(), ms(40));
    }

    #[test]
    fn flex_measures_deflection_from_calibrated_rest() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let clock = ManualClock::new();
        let mut driver = AnalogDriver::new(AnalogProfile::FLEX);
        driver.register(&mut board, 5, 25).unwrap();

        handle.set_analog(25, 2000);
        driver
            .calibrate(&mut board, &clock, 5, CalibrationPlan { samples: 3, interval: ms(1) })
            .unwrap();
        assert_eq!(driver.descriptor(5).unwrap().baseline, 2000.0);
        assert!((driver.threshold(5) - 0.15).abs() < 1e-6);

        handle.set_analog(25, 2000 - 1024);
        let value = driver.read(&mut board, 5, ms(10));
        assert!((value - 1024.0 / ADC_MAX as f32).abs() < 1e-6);
        assert!(driver.evaluate(5, value, ms(10)));
    }

    #[test]
    fn calibrating_unknown_channel_fails() {
        let mut board = SimulatedHardware::new();
        let clock = ManualClock::new();
        let mut driver = AnalogDriver::new(AnalogProfile::PRESSURE);
        let err = driver
            .calibrate(&mut board, &clock, 3, CalibrationPlan::default())
            .unwrap_err();
        assert!(matches!(err, BitesError::InvalidChannel(3)));
    }
}
