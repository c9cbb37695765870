use std::time::Duration;

use tracing::{info, warn};

use super::{CalibrationPlan, ChannelDescriptor, ChannelDriver, ChannelId, Technology};
use crate::clock::Clock;
use crate::hal::{Hardware, RawInertialFrame};
use crate::{BitesError, Result};

/// Counts per g at the ±2 g accelerometer range.
const ACCEL_COUNTS_PER_G: f32 = 16384.0;
/// Counts per deg/s at the ±250 deg/s gyroscope range.
const GYRO_COUNTS_PER_DPS: f32 = 131.0;
const TEMPERATURE_COUNTS_PER_C: f32 = 340.0;
const TEMPERATURE_OFFSET_C: f32 = 36.53;

/// One converted inertial sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InertialReading {
    /// Acceleration in g.
    pub accel: [f32; 3],
    /// Bias-corrected angular velocity in deg/s.
    pub gyro: [f32; 3],
    pub temperature: f32,
    /// Orientation in degrees.
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub timestamp: Duration,
}

impl InertialReading {
    pub fn accel_magnitude(&self) -> f32 {
        magnitude(self.accel)
    }

    pub fn gyro_magnitude(&self) -> f32 {
        magnitude(self.gyro)
    }
}

fn magnitude(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn wrap_degrees(angle: f32) -> f32 {
    let mut wrapped = angle % 360.0;
    if wrapped > 180.0 {
        wrapped -= 360.0;
    } else if wrapped <= -180.0 {
        wrapped += 360.0;
    }
    wrapped
}

fn raw_gyro(frame: &RawInertialFrame) -> [f32; 3] {
    frame.gyro.map(|counts| f32::from(counts) / GYRO_COUNTS_PER_DPS)
}

#[derive(Debug, Clone)]
struct InertialSlot {
    id: ChannelId,
    pin: u8,
    threshold: f32,
    gyro_bias: [f32; 3],
    yaw: f32,
    last_time: Option<Duration>,
    latest: Option<InertialReading>,
    last_value: f32,
    velocity: f32,
    online: bool,
}

/// Driver for the single accelerometer/gyroscope unit.
///
/// The channel value is the acceleration magnitude and its velocity is the
/// angular-velocity magnitude. Inertial channels never trigger; gestures are
/// derived from them by sensor fusion and inference instead.
#[derive(Debug, Default)]
pub struct InertialDriver {
    slot: Option<InertialSlot>,
}

impl InertialDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest converted reading, if the channel has been read at least once.
    pub fn latest(&self) -> Option<InertialReading> {
        self.slot.as_ref().and_then(|slot| slot.latest)
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.slot.as_ref().map(|slot| slot.id)
    }

    fn slot_mut(&mut self, id: ChannelId) -> Option<&mut InertialSlot> {
        match self.slot.as_mut() {
            Some(slot) if slot.id == id => Some(slot),
            _ => {
                warn!(channel = id, technology = %Technology::Inertial, "unknown channel");
                None
            }
        }
    }

    fn slot(&self, id: ChannelId) -> Option<&InertialSlot> {
        self.slot.as_ref().filter(|slot| slot.id == id)
    }
}

impl ChannelDriver for InertialDriver {
    fn technology(&self) -> Technology {
        Technology::Inertial
    }

    fn len(&self) -> usize {
        usize::from(self.slot.is_some())
    }

    fn contains(&self, id: ChannelId) -> bool {
        self.slot(id).is_some()
    }

    fn register(&mut self, hw: &mut dyn Hardware, id: ChannelId, pin: u8) -> Result<()> {
        if self.contains(id) {
            return Err(BitesError::DuplicateChannel(id));
        }
        if self.slot.is_some() {
            return Err(BitesError::CapacityExceeded {
                what: "inertial driver",
                capacity: 1,
            });
        }
        if !hw.inertial_connected() {
            return Err(BitesError::HardwareUnavailable(
                "inertial unit not connected".to_string(),
            ));
        }

        self.slot = Some(InertialSlot {
            id,
            pin,
            threshold: 0.0,
            gyro_bias: [0.0; 3],
            yaw: 0.0,
            last_time: None,
            latest: None,
            last_value: 0.0,
            velocity: 0.0,
            online: true,
        });
        info!(channel = id, technology = %Technology::Inertial, "inertial unit initialised");
        Ok(())
    }

    fn unregister(&mut self, id: ChannelId) -> bool {
        if self.contains(id) {
            self.slot = None;
            true
        } else {
            false
        }
    }

    /// Averages the gyroscope at rest into a bias and zeroes the yaw.
    fn calibrate(
        &mut self,
        hw: &mut dyn Hardware,
        clock: &dyn Clock,
        id: ChannelId,
        plan: CalibrationPlan,
    ) -> Result<()> {
        let slot = self.slot_mut(id).ok_or(BitesError::InvalidChannel(id))?;

        let samples = plan.samples.max(1);
        let mut sum = [0.0f32; 3];
        for _ in 0..samples {
            let gyro = raw_gyro(&hw.read_inertial()?);
            for (total, axis) in sum.iter_mut().zip(gyro) {
                *total += axis;
            }
            clock.sleep(plan.interval);
        }

        slot.gyro_bias = sum.map(|total| total / samples as f32);
        slot.yaw = 0.0;
        slot.last_time = None;

        info!(channel = id, bias = ?slot.gyro_bias, "inertial unit calibrated");
        Ok(())
    }

    fn read(&mut self, hw: &mut dyn Hardware, id: ChannelId, now: Duration) -> f32 {
        let Some(slot) = self.slot_mut(id) else {
            return 0.0;
        };

        let frame = match hw.read_inertial() {
            Ok(frame) => frame,
            Err(err) => {
                if slot.online {
                    warn!(channel = id, error = %err, "inertial read failed");
                    slot.online = false;
                }
                return slot.last_value;
            }
        };
        if !slot.online {
            info!(channel = id, "inertial unit responding again");
            slot.online = true;
        }

        let accel = frame.accel.map(|counts| f32::from(counts) / ACCEL_COUNTS_PER_G);
        let raw = raw_gyro(&frame);
        let gyro = [
            raw[0] - slot.gyro_bias[0],
            raw[1] - slot.gyro_bias[1],
            raw[2] - slot.gyro_bias[2],
        ];

        if let Some(previous) = slot.last_time {
            let dt = now.saturating_sub(previous).as_secs_f32();
            slot.yaw = wrap_degrees(slot.yaw + gyro[2] * dt);
        }
        slot.last_time = Some(now);

        let reading = InertialReading {
            accel,
            gyro,
            temperature: f32::from(frame.temperature) / TEMPERATURE_COUNTS_PER_C
                + TEMPERATURE_OFFSET_C,
            roll: accel[1].atan2(accel[2]).to_degrees(),
            pitch: (-accel[0])
                .atan2((accel[1] * accel[1] + accel[2] * accel[2]).sqrt())
                .to_degrees(),
            yaw: slot.yaw,
            timestamp: now,
        };

        slot.latest = Some(reading);
        slot.last_value = reading.accel_magnitude();
        slot.velocity = reading.gyro_magnitude();
        slot.last_value
    }

    fn velocity(&self, id: ChannelId) -> f32 {
        self.slot(id).map(|slot| slot.velocity).unwrap_or(0.0)
    }

    fn evaluate(&mut self, _id: ChannelId, _value: f32, _now: Duration) -> bool {
        false
    }

    fn last_trigger_time(&self, _id: ChannelId) -> Option<Duration> {
        None
    }

    fn set_threshold(&mut self, id: ChannelId, threshold: f32) {
        if let Some(slot) = self.slot_mut(id) {
            slot.threshold = threshold;
        }
    }

    fn threshold(&self, id: ChannelId) -> f32 {
        self.slot(id).map(|slot| slot.threshold).unwrap_or(0.0)
    }

    fn set_baseline(&mut self, _id: ChannelId, _baseline: f32) {}

    fn set_debounce_time(&mut self, _id: ChannelId, _window: Duration) {}

    fn descriptor(&self, id: ChannelId) -> Option<ChannelDescriptor> {
        self.slot(id).map(|slot| ChannelDescriptor {
            channel_id: slot.id,
            technology: Technology::Inertial,
            hardware_pin: slot.pin,
            baseline: 0.0,
            threshold: slot.threshold,
            debounce_window: Duration::ZERO,
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
    fn converts_frame_to_physical_units() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = InertialDriver::new();
        driver.register(&mut board, 6, 0).unwrap();

        handle.set_inertial(RawInertialFrame {
            accel: [0, 16384, 0],
            temperature: 340,
            gyro: [131, 0, 0],
        });

        let value = driver.read(&mut board, 6, ms(0));
        assert!((value - 1.0).abs() < 1e-6);
        assert!((driver.velocity(6) - 1.0).abs() < 1e-6);

        let reading = driver.latest().unwrap();
        assert!((reading.roll - 90.0).abs() < 1e-4);
        assert!(reading.pitch.abs() < 1e-4);
        assert!((reading.temperature - 37.53).abs() < 1e-4);
        assert!(!driver.is_triggered(&mut board, 6, ms(1)));
    }

    #[test]
    fn yaw_integrates_bias_corrected_rate() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let clock = ManualClock::new();
        let mut driver = InertialDriver::new();
        driver.register(&mut board, 0, 0).unwrap();

        // Resting drift of 1 deg/s on Z is calibrated out.
        handle.set_inertial(RawInertialFrame {
            accel: [0, 0, 16384],
            temperature: 0,
            gyro: [0, 0, 131],
        });
        driver
            .calibrate(&mut board, &clock, 0, CalibrationPlan { samples: 4, interval: ms(1) })
            .unwrap();

        // Turning at 91 deg/s raw, 90 deg/s after bias, for 1 second.
        handle.set_inertial(RawInertialFrame {
            accel: [0, 0, 16384],
            temperature: 0,
            gyro: [0, 0, 131 * 91],
        });
        driver.read(&mut board, 0, ms(0));
        driver.read(&mut board, 0, ms(1000));

        let yaw = driver.latest().unwrap().yaw;
        assert!((yaw - 90.0).abs() < 0.01, "yaw was {yaw}");
    }

    #[test]
    fn registration_requires_connected_unit_and_single_slot() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = InertialDriver::new();

        handle.set_inertial_online(false);
        assert!(matches!(
            driver.register(&mut board, 0, 0),
            Err(BitesError::HardwareUnavailable(_))
        ));

        handle.set_inertial_online(true);
        driver.register(&mut board, 0, 0).unwrap();
        assert!(matches!(
            driver.register(&mut board, 1, 0),
            Err(BitesError::CapacityExceeded { capacity: 1, .. })
        ));
    }

    #[test]
    fn failed_reads_hold_last_value() {
        let mut board = SimulatedHardware::new();
        let handle = board.handle();
        let mut driver = InertialDriver::new();
        driver.register(&mut board, 2, 0).unwrap();

        let first = driver.read(&mut board, 2, ms(0));
        handle.set_inertial_online(false);
        assert_eq!(driver.read(&mut board, 2, ms(1)), first);
    }

    #[test]
    fn wraps_angles_into_half_open_range() {
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_eq!(wrap_degrees(45.0), 45.0);
    }
}
