use serde::{Deserialize, Serialize};

/// Default process noise (Q) used by the fusion filters.
pub const DEFAULT_PROCESS_NOISE: f32 = 0.1;
/// Default measurement noise (R) used by the fusion filters.
pub const DEFAULT_MEASUREMENT_NOISE: f32 = 0.1;

/// Scalar Kalman estimator smoothing one measurement stream.
///
/// Each instance belongs to exactly one consumer and is never shared between
/// threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFilter {
    process_noise: f32,
    measurement_noise: f32,
    error_covariance: f32,
    estimate: f32,
    gain: f32,
}

impl KalmanFilter {
    /// Creates a filter with the given Q and R, starting from P = 1, X = 0.
    pub fn new(process_noise: f32, measurement_noise: f32) -> Self {
        let mut filter = Self {
            process_noise,
            measurement_noise,
            error_covariance: 1.0,
            estimate: 0.0,
            gain: 0.0,
        };
        filter.init(process_noise, measurement_noise);
        filter
    }

    /// Sets Q and R and restarts the estimate.
    pub fn init(&mut self, process_noise: f32, measurement_noise: f32) {
        self.process_noise = process_noise;
        self.measurement_noise = measurement_noise;
        self.reset();
    }

    /// Runs one predict/correct cycle and returns the new estimate.
    pub fn update(&mut self, measurement: f32) -> f32 {
        self.error_covariance += self.process_noise;

        self.gain = self.error_covariance / (self.error_covariance + self.measurement_noise);
        self.estimate += self.gain * (measurement - self.estimate);
        self.error_covariance *= 1.0 - self.gain;

        self.estimate
    }

    /// Restores P = 1 and X = 0, keeping Q and R.
    pub fn reset(&mut self) {
        self.error_covariance = 1.0;
        self.estimate = 0.0;
        self.gain = 0.0;
    }

    pub fn estimate(&self) -> f32 {
        self.estimate
    }

    pub fn error_covariance(&self) -> f32 {
        self.error_covariance
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn process_noise(&self) -> f32 {
        self.process_noise
    }

    pub fn measurement_noise(&self) -> f32 {
        self.measurement_noise
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESS_NOISE, DEFAULT_MEASUREMENT_NOISE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_input_rises_monotonically_without_overshoot() {
        let mut filter = KalmanFilter::new(0.1, 0.1);
        let mut previous = filter.estimate();

        for _ in 0..5 {
            let estimate = filter.update(10.0);
            assert!(estimate > previous, "{estimate} should exceed {previous}");
            assert!(estimate <= 10.0);
            assert!(estimate >= 0.0);
            previous = estimate;
        }
    }

    #[test]
    fn absolute_error_never_grows_and_converges() {
        let measurement = -3.5;
        let mut filter = KalmanFilter::new(0.05, 0.4);
        let mut last_error = (filter.estimate() - measurement).abs();

        for _ in 0..200 {
            let error = (filter.update(measurement) - measurement).abs();
            assert!(error <= last_error);
            last_error = error;
        }

        assert!(last_error < 1e-3, "residual error {last_error}");
    }

    #[test]
    fn first_update_uses_expected_gain() {
        let mut filter = KalmanFilter::new(0.1, 0.1);
        // P = 1.1, K = 1.1 / 1.2
        let estimate = filter.update(10.0);
        let expected_gain = 1.1 / 1.2;
        assert!((filter.gain() - expected_gain).abs() < 1e-6);
        assert!((estimate - 10.0 * expected_gain).abs() < 1e-5);
        assert!((filter.error_covariance() - (1.0 - expected_gain) * 1.1).abs() < 1e-6);
    }

    #[test]
    fn reset_keeps_noise_parameters() {
        let mut filter = KalmanFilter::new(0.2, 0.7);
        filter.update(4.0);
        filter.update(4.0);

        filter.reset();

        assert_eq!(filter.estimate(), 0.0);
        assert_eq!(filter.error_covariance(), 1.0);
        assert_eq!(filter.process_noise(), 0.2);
        assert_eq!(filter.measurement_noise(), 0.7);
    }
}
