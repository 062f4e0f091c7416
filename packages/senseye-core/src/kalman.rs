//! Adaptive Kalman filter bank: one constant-velocity filter per
//! (observer, target) signal path, with innovation-triggered process-noise
//! inflation so the filter "unlocks" on abrupt environmental changes rather
//! than dragging behind them.

use std::collections::HashMap;

use nalgebra::{Matrix2, RowVector2, Vector2};
use parking_lot::Mutex;

/// Default adaptive threshold (in units of innovation standard deviations)
/// above which process noise is inflated for one step.
pub const DEFAULT_ADAPTIVE_THRESHOLD: f64 = 3.0;
/// Default one-step process noise inflation factor.
pub const DEFAULT_SCALING_FACTOR: f64 = 100.0;
/// Default continuous-time process noise spectral density.
pub const DEFAULT_PROCESS_NOISE: f64 = 0.1;
/// Default measurement noise variance, in dB^2.
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 4.0;

/// A single constant-velocity Kalman filter over state `x = [rssi, drssi/dt]`.
///
/// Re-predicts with an inflated process noise for one step whenever the
/// normalized innovation exceeds `adaptive_threshold`, then updates the
/// covariance in Joseph form so it stays symmetric positive-semidefinite
/// under numerical drift.
#[derive(Debug, Clone)]
pub struct KalmanFilter1D {
    process_noise: f64,
    measurement_noise: f64,
    adaptive_threshold: f64,
    scaling_factor: f64,
    dt: f64,
    initialized: bool,
    x: Vector2<f64>,
    p: Matrix2<f64>,
}

impl KalmanFilter1D {
    /// Creates a filter with the spec's default adaptive parameters.
    #[must_use]
    pub fn new(process_noise: f64, measurement_noise: f64, dt: f64) -> Self {
        Self::with_params(
            process_noise,
            measurement_noise,
            DEFAULT_ADAPTIVE_THRESHOLD,
            DEFAULT_SCALING_FACTOR,
            dt,
        )
    }

    /// Creates a filter with fully explicit parameters (used directly by the
    /// Kalman-jump test scenario).
    #[must_use]
    pub fn with_params(
        process_noise: f64,
        measurement_noise: f64,
        adaptive_threshold: f64,
        scaling_factor: f64,
        dt: f64,
    ) -> Self {
        Self {
            process_noise,
            measurement_noise,
            adaptive_threshold,
            scaling_factor,
            dt,
            initialized: false,
            x: Vector2::zeros(),
            // Generous initial uncertainty; corrected by the first few updates.
            p: Matrix2::identity() * 10.0,
        }
    }

    /// Updates the timestep used for the next prediction. The orchestrator
    /// calls this each cycle with the elapsed time since the last
    /// observation on this path, since scan cadence is not perfectly regular.
    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt.max(1e-3);
    }

    fn transition(&self) -> Matrix2<f64> {
        Matrix2::new(1.0, self.dt, 0.0, 1.0)
    }

    /// Discrete white-noise-acceleration process noise, scaled by `scale`
    /// (1.0 nominally, `scaling_factor` when the filter is "unlocking").
    fn process_noise_matrix(&self, scale: f64) -> Matrix2<f64> {
        let dt = self.dt;
        let q = self.process_noise * scale;
        Matrix2::new(
            dt.powi(4) / 4.0,
            dt.powi(3) / 2.0,
            dt.powi(3) / 2.0,
            dt.powi(2),
        ) * q
    }

    /// Feeds one measurement through predict/update. Returns
    /// `(filtered_rssi, innovation)`.
    pub fn update(&mut self, z: f64) -> (f64, f64) {
        if !self.initialized {
            self.x = Vector2::new(z, 0.0);
            self.initialized = true;
            return (z, 0.0);
        }

        let f = self.transition();
        let h = RowVector2::new(1.0, 0.0);

        let x_pred = f * self.x;
        let mut p_pred = f * self.p * f.transpose() + self.process_noise_matrix(1.0);

        let innovation = z - (h * x_pred)[0];
        let s = (h * p_pred * h.transpose())[(0, 0)] + self.measurement_noise;
        let normalized = innovation.abs() / s.sqrt().max(1e-12);

        if normalized > self.adaptive_threshold {
            p_pred = f * self.p * f.transpose() + self.process_noise_matrix(self.scaling_factor);
        }

        let s = (h * p_pred * h.transpose())[(0, 0)] + self.measurement_noise;
        let k = p_pred * h.transpose() / s;

        self.x = x_pred + k * innovation;

        let identity = Matrix2::identity();
        let i_kh = identity - k * h;
        self.p = i_kh * p_pred * i_kh.transpose() + k * self.measurement_noise * k.transpose();

        (self.x[0], innovation)
    }

    /// The current filtered RSSI estimate without feeding a new measurement.
    #[must_use]
    pub fn filtered_rssi(&self) -> f64 {
        self.x[0]
    }

    /// The current estimated rate of change, dB/s.
    #[must_use]
    pub fn drssi_dt(&self) -> f64 {
        self.x[1]
    }

    /// Whether the covariance is symmetric to within floating-point slop and
    /// has a non-negative diagonal — the invariant this filter must preserve
    /// after every update.
    #[must_use]
    pub fn covariance_is_valid(&self) -> bool {
        let symmetric = (self.p[(0, 1)] - self.p[(1, 0)]).abs() < 1e-6;
        let non_negative_diagonal = self.p[(0, 0)] >= -1e-9 && self.p[(1, 1)] >= -1e-9;
        symmetric && non_negative_diagonal
    }
}

/// Lazily-created bank of one [`KalmanFilter1D`] per (observer, target) path.
pub struct FilterBank {
    filters: Mutex<HashMap<(String, String), KalmanFilter1D>>,
    last_timestamp: Mutex<HashMap<(String, String), f64>>,
    process_noise: f64,
    measurement_noise: f64,
    default_dt: f64,
}

impl FilterBank {
    /// Creates a bank using the spec's default process/measurement noise.
    #[must_use]
    pub fn new(default_dt: f64) -> Self {
        Self::with_noise(DEFAULT_PROCESS_NOISE, DEFAULT_MEASUREMENT_NOISE, default_dt)
    }

    /// Creates a bank with explicit process/measurement noise (useful for
    /// tuning per deployment).
    #[must_use]
    pub fn with_noise(process_noise: f64, measurement_noise: f64, default_dt: f64) -> Self {
        Self {
            filters: Mutex::new(HashMap::new()),
            last_timestamp: Mutex::new(HashMap::new()),
            process_noise,
            measurement_noise,
            default_dt,
        }
    }

    /// Filters one measurement on the (observer, target) path, lazily
    /// creating the filter on first contact and deriving `dt` from the
    /// elapsed time since the path's last observation.
    pub fn update(
        &self,
        observer_id: &str,
        target_id: &str,
        measurement: f64,
        timestamp: f64,
    ) -> (f64, f64) {
        let key = (observer_id.to_string(), target_id.to_string());

        let dt = {
            let mut last = self.last_timestamp.lock();
            let dt = last
                .get(&key)
                .map(|prev| (timestamp - prev).max(1e-3))
                .unwrap_or(self.default_dt);
            last.insert(key.clone(), timestamp);
            dt
        };

        let mut filters = self.filters.lock();
        let filter = filters
            .entry(key)
            .or_insert_with(|| KalmanFilter1D::new(self.process_noise, self.measurement_noise, dt));
        filter.set_dt(dt);
        filter.update(measurement)
    }

    /// Number of (observer, target) paths this bank currently tracks.
    pub fn path_count(&self) -> usize {
        self.filters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn an_abrupt_jump_unlocks_the_filter_instead_of_dragging() {
        let mut filter = KalmanFilter1D::with_params(0.1, 1.0, 2.0, 200.0, 1.0);
        for _ in 0..5 {
            filter.update(-70.0);
        }
        let (filtered, innovation) = filter.update(-50.0);

        assert!(filtered > -60.0, "expected filtered > -60.0, got {filtered}");
        assert!(innovation > 0.0, "expected positive innovation, got {innovation}");
    }

    #[test]
    fn covariance_stays_symmetric_positive_semidefinite_after_any_finite_update() {
        let mut filter = KalmanFilter1D::new(0.1, 1.0, 1.0);
        for z in [-70.0, -68.0, -90.0, -40.0, -72.5] {
            filter.update(z);
            assert!(filter.covariance_is_valid());
        }
    }

    #[test]
    fn first_update_passes_the_measurement_through_with_zero_innovation() {
        let mut filter = KalmanFilter1D::new(0.1, 1.0, 1.0);
        let (filtered, innovation) = filter.update(-65.0);
        assert_eq!(filtered, -65.0);
        assert_eq!(innovation, 0.0);
    }

    #[test]
    fn filter_bank_lazily_creates_one_filter_per_path() {
        let bank = FilterBank::new(1.0);
        bank.update("node-a", "phone-1", -60.0, 0.0);
        bank.update("node-a", "phone-2", -55.0, 0.0);
        bank.update("node-b", "phone-1", -70.0, 0.0);
        assert_eq!(bank.path_count(), 3);
    }
}
