//! Smoothed orientation and motion estimates from the inertial channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::drivers::InertialReading;
use crate::filter::{KalmanFilter, DEFAULT_MEASUREMENT_NOISE, DEFAULT_PROCESS_NOISE};

/// Anything that can hand out the freshest inertial reading.
pub trait InertialSource: Send + Sync {
    fn latest_inertial(&self) -> Option<InertialReading>;
}

/// Current filter estimates. Angles are in degrees, acceleration in g and
/// angular velocity in deg/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionEstimates {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub accel_magnitude: f32,
    pub gyro_magnitude: f32,
}

/// Five independent scalar filters fed from one inertial source.
///
/// The per-axis getters ([`SensorFusion::roll`] and friends) pull a fresh
/// reading and advance their filter by one step each time they are called,
/// so two consecutive calls can return different values. Use
/// [`SensorFusion::estimates`] for a read that leaves the filters untouched.
pub struct SensorFusion {
    source: Arc<dyn InertialSource>,
    roll: KalmanFilter,
    pitch: KalmanFilter,
    yaw: KalmanFilter,
    accel: KalmanFilter,
    gyro: KalmanFilter,
    updates: u64,
}

impl SensorFusion {
    pub fn new(source: Arc<dyn InertialSource>) -> Self {
        Self::with_noise(source, DEFAULT_PROCESS_NOISE, DEFAULT_MEASUREMENT_NOISE)
    }

    pub fn with_noise(
        source: Arc<dyn InertialSource>,
        process_noise: f32,
        measurement_noise: f32,
    ) -> Self {
        let filter = KalmanFilter::new(process_noise, measurement_noise);
        Self {
            source,
            roll: filter.clone(),
            pitch: filter.clone(),
            yaw: filter.clone(),
            accel: filter.clone(),
            gyro: filter,
            updates: 0,
        }
    }

    /// Advances every filter by one step. Returns `None` and leaves the
    /// filters alone when no reading is available yet.
    pub fn update(&mut self) -> Option<FusionEstimates> {
        let reading = self.source.latest_inertial()?;
        self.roll.update(reading.roll);
        self.pitch.update(reading.pitch);
        self.yaw.update(reading.yaw);
        self.accel.update(reading.accel_magnitude());
        self.gyro.update(reading.gyro_magnitude());
        self.updates += 1;
        Some(self.estimates())
    }

    /// Filter estimates without advancing any state.
    pub fn estimates(&self) -> FusionEstimates {
        FusionEstimates {
            roll: self.roll.estimate(),
            pitch: self.pitch.estimate(),
            yaw: self.yaw.estimate(),
            accel_magnitude: self.accel.estimate(),
            gyro_magnitude: self.gyro.estimate(),
        }
    }

    /// Advances the roll filter with the freshest reading.
    pub fn roll(&mut self) -> f32 {
        Self::advance(&mut self.roll, self.source.latest_inertial().map(|r| r.roll))
    }

    pub fn pitch(&mut self) -> f32 {
        Self::advance(&mut self.pitch, self.source.latest_inertial().map(|r| r.pitch))
    }

    pub fn yaw(&mut self) -> f32 {
        Self::advance(&mut self.yaw, self.source.latest_inertial().map(|r| r.yaw))
    }

    pub fn accel_magnitude(&mut self) -> f32 {
        let measurement = self.source.latest_inertial().map(|r| r.accel_magnitude());
        Self::advance(&mut self.accel, measurement)
    }

    pub fn gyro_magnitude(&mut self) -> f32 {
        let measurement = self.source.latest_inertial().map(|r| r.gyro_magnitude());
        Self::advance(&mut self.gyro, measurement)
    }

    /// Raw reading the filters are fed from.
    pub fn latest_reading(&self) -> Option<InertialReading> {
        self.source.latest_inertial()
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Resets every filter's covariance and estimate.
    pub fn reset(&mut self) {
        for filter in [
            &mut self.roll,
            &mut self.pitch,
            &mut self.yaw,
            &mut self.accel,
            &mut self.gyro,
        ] {
            filter.reset();
        }
        self.updates = 0;
    }

    fn advance(filter: &mut KalmanFilter, measurement: Option<f32>) -> f32 {
        match measurement {
            Some(value) => filter.update(value),
            None => filter.estimate(),
        }
    }
}

impl std::fmt::Debug for SensorFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorFusion")
            .field("estimates", &self.estimates())
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}
