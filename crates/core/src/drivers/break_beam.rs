use std::time::Duration;

use tracing::{info, warn};

use super::{
    CalibrationPlan, ChannelDescriptor, ChannelDriver, ChannelId, Debouncer, Technology,
    DRIVER_CAPACITY,
};
use crate::clock::Clock;
use crate::hal::{Hardware, PinMode};
use crate::{BitesError, Result};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct BeamSlot {
    id: ChannelId,
    pin: u8,
    /// Logic level that means "beam interrupted". The receiver idles HIGH on
    /// its pull-up and is pulled LOW when the beam is broken.
    active_level: bool,
    rest_level: bool,
    last_value: f32,
    velocity: f32,
    debouncer: Debouncer,
}

fn level_value(level: bool) -> f32 {
    if level {
        1.0
    } else {
        0.0
    }
}

/// Driver for infrared break-beam channels. Values are logic levels
/// (`1.0` HIGH, `0.0` LOW); the threshold is the active level.
#[derive(Debug)]
pub struct BreakBeamDriver {
    slots: [Option<BeamSlot>; DRIVER_CAPACITY],
}

impl BreakBeamDriver {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    fn slot(&self, id: ChannelId) -> Option<&BeamSlot> {
        self.slots.iter().flatten().find(|slot| slot.id == id)
    }

    fn slot_mut(&mut self, id: ChannelId) -> Option<&mut BeamSlot> {
        let slot = self.slots.iter_mut().flatten().find(|slot| slot.id == id);
        if slot.is_none() {
            warn!(channel = id, technology = %Technology::BreakBeam, "unknown channel");
        }
        slot
    }
}

impl Default for BreakBeamDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDriver for BreakBeamDriver {
    fn technology(&self) -> Technology {
        Technology::BreakBeam
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
                what: "break-beam driver",
                capacity: DRIVER_CAPACITY,
            })?;

        hw.configure_pin(pin, PinMode::InputPullup);
        let rest_level = true;
        *free = Some(BeamSlot {
            id,
            pin,
            active_level: !rest_level,
            rest_level,
            last_value: level_value(rest_level),
            velocity: 0.0,
            debouncer: Debouncer::new(DEFAULT_DEBOUNCE),
        });

        info!(channel = id, pin, technology = %Technology::BreakBeam, "channel initialised");
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

    /// Samples the idle level; the active level becomes its opposite.
    fn calibrate(
        &mut self,
        hw: &mut dyn Hardware,
        clock: &dyn Clock,
        id: ChannelId,
        plan: CalibrationPlan,
    ) -> Result<()> {
        let slot = self.slot_mut(id).ok_or(BitesError::InvalidChannel(id))?;

        let samples = plan.samples.max(1);
        let mut high = 0u32;
        for _ in 0..samples {
            if hw.digital_read(slot.pin) {
                high += 1;
            }
            clock.sleep(plan.interval);
        }

        slot.rest_level = high * 2 >= samples;
        slot.active_level = !slot.rest_level;
        slot.last_value = level_value(slot.rest_level);

        info!(
            channel = id,
            rest_high = slot.rest_level,
            "break-beam calibrated"
        );
        Ok(())
    }

    fn read(&mut self, hw: &mut dyn Hardware, id: ChannelId, _now: Duration) -> f32 {
        let Some(slot) = self.slot_mut(id) else {
            return 0.0;
        };
        let value = level_value(hw.digital_read(slot.pin));
        slot.velocity = (value - slot.last_value).abs();
        slot.last_value = value;
        value
    }

    fn velocity(&self, id: ChannelId) -> f32 {
        self.slot(id).map(|slot| slot.velocity).unwrap_or(0.0)
    }

    fn evaluate(&mut self, id: ChannelId, value: f32, now: Duration) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                let level = value >= 0.5;
                slot.debouncer.accept(level == slot.active_level, now)
            }
            None => false,
        }
    }

    fn last_trigger_time(&self, id: ChannelId) -> Option<Duration> {
        self.slot(id).and_then(|slot| slot.debouncer.last_accepted())
    }

    fn set_threshold(&mut self, id: ChannelId, threshold: f32) {
        if let Some(slot) = self.slot_mut(id) {
            slot.active_level = threshold >= 0.5;
        }
    }

    fn threshold(&self, id: ChannelId) -> f32 {
        self.slot(id)
            .map(|slot| level_value(slot.active_level))
            .unwrap_or(0.0)
    }

    fn set_baseline(&mut self, id: ChannelId, baseline: f32) {
        if let Some(slot) = self.slot_mut(id) {
            slot.rest_level = baseline >= 0.5;
            slot.last_value = level_value(slot.rest_level);
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
            technology: Technology::BreakBeam,
            hardware_pin: slot.pin,
            baseline: level_value(slot.rest_level),
            threshold: level_value(slot.active_level),
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

    #[test]
    fn triggers_on_active_level_with_debounce() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = BreakBeamDriver::new();
        driver.register(&mut board, 0, 2).unwrap();
        assert_eq!(handle.pin_mode(2), Some(PinMode::InputPullup));

        assert!(!driver.is_triggered(&mut board, 0, ms(0)));

        handle.set_digital(2, false);
        assert!(driver.is_triggered(&mut board, 0, ms(1)));
        assert!(!driver.is_triggered(&mut board, 0, ms(5)));
        assert!(driver.is_triggered(&mut board, 0, ms(11)));

        handle.set_digital(2, true);
        assert!(!driver.is_triggered(&mut board, 0, ms(40)));
    }

    #[test]
    fn calibration_inverts_the_rest_level() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let clock = ManualClock::new();
        let mut driver = BreakBeamDriver::new();
        driver.register(&mut board, 3, 4).unwrap();

        // Receiver wired active-high: idles LOW.
        handle.set_digital(4, false);
        driver
            .calibrate(&mut board, &clock, 3, CalibrationPlan { samples: 5, interval: ms(2) })
            .unwrap();

        assert_eq!(driver.threshold(3), 1.0);
        assert_eq!(driver.descriptor(3).unwrap().baseline, 0.0);

        handle.set_digital(4, true);
        assert!(driver.is_triggered(&mut board, 3, ms(100)));
    }

    #[test]
    fn threshold_accessors_map_levels() {
        let mut board = SimulatedHardware::new();
        let mut driver = BreakBeamDriver::new();
        driver.register(&mut board, 1, 3).unwrap();

        assert_eq!(driver.threshold(1), 0.0);
        driver.set_threshold(1, 1.0);
        assert_eq!(driver.threshold(1), 1.0);
        assert_eq!(driver.threshold(7), 0.0);
    }

    #[test]
    fn idle_beam_has_no_velocity_on_first_read() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = BreakBeamDriver::new();
        driver.register(&mut board, 0, 2).unwrap();

        assert_eq!(driver.read(&mut board, 0, ms(0)), 1.0);
        assert_eq!(driver.velocity(0), 0.0);

        handle.set_digital(2, false);
        driver.read(&mut board, 0, ms(1));
        assert_eq!(driver.velocity(0), 1.0);
    }
}
