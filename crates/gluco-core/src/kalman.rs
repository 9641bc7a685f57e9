//! Linear Kalman filter over scalars or dense matrices.
//!
//! [`KalmanFilter`] is generic over [`KalmanInput`], so the same
//! predict/update code runs a one-dimensional level model on `f64` and a
//! multi-state model on [`Matrix`]. Filters are values: each step returns a
//! new filter and leaves the old one untouched.
//!
//! [`smooth_series`] wraps the two models the calibrator uses.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};

const SINGULAR_EPSILON: f64 = 1e-12;

/// Operations the filter needs from its state and covariance type.
pub trait KalmanInput:
    Clone + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self>
{
    /// Transpose.
    #[must_use]
    fn transposed(&self) -> Self;

    /// Inverse, or `None` when singular.
    fn inverse(&self) -> Option<Self>;

    /// `I - self`.
    #[must_use]
    fn addition_to_unit(&self) -> Self;
}

impl KalmanInput for f64 {
    fn transposed(&self) -> Self {
        *self
    }

    fn inverse(&self) -> Option<Self> {
        (self.abs() > SINGULAR_EPSILON).then(|| self.recip())
    }

    fn addition_to_unit(&self) -> Self {
        1.0 - self
    }
}

/// Dense row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Builds a matrix from row-major `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DimensionMismatch`] if `data` does not hold
    /// exactly `rows * cols` values.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(CoreError::DimensionMismatch {
                left: (rows, cols),
                right: (data.len(), 1),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// All-zero matrix.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Square identity matrix.
    #[must_use]
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    /// Column vector.
    #[must_use]
    pub fn column(values: &[f64]) -> Self {
        Self {
            rows: values.len(),
            cols: 1,
            data: values.to_vec(),
        }
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Element at `(row, col)`.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    fn mismatch(&self, other: &Self) -> CoreError {
        CoreError::DimensionMismatch {
            left: self.dimensions(),
            right: other.dimensions(),
        }
    }

    /// Element-wise sum.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DimensionMismatch`] for differently shaped operands.
    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise difference.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DimensionMismatch`] for differently shaped operands.
    pub fn checked_sub(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a - b)
    }

    fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        if self.dimensions() != other.dimensions() {
            return Err(self.mismatch(other));
        }
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Matrix product.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DimensionMismatch`] when the inner dimensions differ.
    pub fn checked_mul(&self, other: &Self) -> Result<Self> {
        if self.cols != other.rows {
            return Err(self.mismatch(other));
        }
        let mut out = Self::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                out.data[i * other.cols + j] = (0..self.cols)
                    .map(|k| self.at(i, k) * other.at(k, j))
                    .sum();
            }
        }
        Ok(out)
    }
}

// Operator forms panic on shape mismatch. Use the checked_* methods where
// shapes are not known to agree.
impl Add for Matrix {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        match self.checked_add(&rhs) {
            Ok(m) => m,
            Err(e) => panic!("{e}"),
        }
    }
}

impl Sub for Matrix {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        match self.checked_sub(&rhs) {
            Ok(m) => m,
            Err(e) => panic!("{e}"),
        }
    }
}

impl Mul for Matrix {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        match self.checked_mul(&rhs) {
            Ok(m) => m,
            Err(e) => panic!("{e}"),
        }
    }
}

impl KalmanInput for Matrix {
    fn transposed(&self) -> Self {
        let mut out = Self::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.data[j * self.rows + i] = self.at(i, j);
            }
        }
        out
    }

    /// Gauss-Jordan elimination with partial pivoting.
    fn inverse(&self) -> Option<Self> {
        if self.rows != self.cols {
            return None;
        }
        let n = self.rows;
        let mut a = self.clone();
        let mut inv = Self::identity(n);

        for col in 0..n {
            let pivot =
                (col..n).max_by(|&x, &y| a.at(x, col).abs().total_cmp(&a.at(y, col).abs()))?;
            if a.at(pivot, col).abs() < SINGULAR_EPSILON {
                return None;
            }
            if pivot != col {
                for k in 0..n {
                    a.data.swap(pivot * n + k, col * n + k);
                    inv.data.swap(pivot * n + k, col * n + k);
                }
            }

            let scale = a.at(col, col);
            for k in 0..n {
                a.data[col * n + k] /= scale;
                inv.data[col * n + k] /= scale;
            }

            for row in (0..n).filter(|&r| r != col) {
                let factor = a.at(row, col);
                if factor == 0.0 {
                    continue;
                }
                for k in 0..n {
                    a.data[row * n + k] -= factor * a.data[col * n + k];
                    inv.data[row * n + k] -= factor * inv.data[col * n + k];
                }
            }
        }
        Some(inv)
    }

    fn addition_to_unit(&self) -> Self {
        let mut out = Self::identity(self.rows);
        for (o, v) in out.data.iter_mut().zip(&self.data) {
            *o -= v;
        }
        out
    }
}

/// Filter state: estimate and its error covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter<T> {
    /// Current state estimate `x`.
    pub state_estimate: T,
    /// Error covariance `P` of the estimate.
    pub error_covariance: T,
}

impl<T: KalmanInput> KalmanFilter<T> {
    /// Creates a filter from an initial estimate and covariance.
    pub const fn new(state_estimate: T, error_covariance: T) -> Self {
        Self {
            state_estimate,
            error_covariance,
        }
    }

    /// Time update: `x = F x + B u`, `P = F P Fᵀ + Q`.
    #[must_use]
    pub fn predict(
        &self,
        state_transition_model: &T,
        control_input_model: &T,
        control_vector: &T,
        process_noise_covariance: &T,
    ) -> Self {
        let f = state_transition_model;
        let state_estimate = f.clone() * self.state_estimate.clone()
            + control_input_model.clone() * control_vector.clone();
        let error_covariance = f.clone() * self.error_covariance.clone() * f.transposed()
            + process_noise_covariance.clone();
        Self {
            state_estimate,
            error_covariance,
        }
    }

    /// Measurement update with observation `z`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SingularCovariance`] if the innovation
    /// covariance `H P Hᵀ + R` cannot be inverted.
    pub fn update(
        &self,
        measurement: &T,
        observation_model: &T,
        observation_noise_covariance: &T,
    ) -> Result<Self> {
        let h = observation_model;
        let innovation = measurement.clone() - h.clone() * self.state_estimate.clone();
        let innovation_covariance = h.clone() * self.error_covariance.clone() * h.transposed()
            + observation_noise_covariance.clone();
        let inverse = innovation_covariance
            .inverse()
            .ok_or(CoreError::SingularCovariance)?;
        let gain = self.error_covariance.clone() * h.transposed() * inverse;

        Ok(Self {
            state_estimate: self.state_estimate.clone() + gain.clone() * innovation,
            error_covariance: (gain * h.clone()).addition_to_unit()
                * self.error_covariance.clone(),
        })
    }
}

/// Which state model to smooth adjusted raw values with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingModel {
    /// No smoothing.
    #[default]
    Off,
    /// Constant level.
    Level,
    /// Level plus per-minute trend, advanced in 5-minute steps.
    LevelAndTrend,
}

/// Kalman smoothing settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// State model.
    pub model: SmoothingModel,
    /// Process noise variance `Q`.
    pub process_noise: f64,
    /// Measurement noise variance `R`.
    pub observation_noise: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            model: SmoothingModel::Off,
            process_noise: 0.01,
            observation_noise: 0.5,
        }
    }
}

/// Minutes between consecutive samples in the trend model.
pub const SAMPLE_INTERVAL_MINUTES: f64 = 5.0;

/// Filters `values` (oldest first) and returns the posterior level for
/// each one. A step whose innovation covariance is singular keeps the
/// unsmoothed value.
#[must_use]
pub fn smooth_series(values: &[f64], config: &SmoothingConfig) -> Vec<f64> {
    match config.model {
        SmoothingModel::Off => values.to_vec(),
        SmoothingModel::Level => smooth_level(values, config),
        SmoothingModel::LevelAndTrend => smooth_level_and_trend(values, config),
    }
}

fn smooth_level(values: &[f64], config: &SmoothingConfig) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let mut filter = KalmanFilter::new(first, config.observation_noise);
    values
        .iter()
        .map(|&z| {
            let predicted = filter.predict(&1.0, &0.0, &0.0, &config.process_noise);
            match predicted.update(&z, &1.0, &config.observation_noise) {
                Ok(updated) => {
                    filter = updated;
                    filter.state_estimate
                }
                Err(e) => {
                    debug!(error = %e, "Level smoothing skipped a sample");
                    filter = predicted;
                    z
                }
            }
        })
        .collect()
}

fn smooth_level_and_trend(values: &[f64], config: &SmoothingConfig) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let dt = SAMPLE_INTERVAL_MINUTES;
    let q = config.process_noise;
    let transition = Matrix {
        rows: 2,
        cols: 2,
        data: vec![1.0, dt, 0.0, 1.0],
    };
    let process_noise = Matrix {
        rows: 2,
        cols: 2,
        data: vec![
            q * dt.powi(3) / 3.0,
            q * dt.powi(2) / 2.0,
            q * dt.powi(2) / 2.0,
            q * dt,
        ],
    };
    let observation = Matrix {
        rows: 1,
        cols: 2,
        data: vec![1.0, 0.0],
    };
    let observation_noise = Matrix::column(&[config.observation_noise]);
    let control_model = Matrix::zeros(2, 1);
    let control = Matrix::zeros(1, 1);

    let mut covariance = Matrix::identity(2);
    covariance.data[0] = config.observation_noise;
    let mut filter = KalmanFilter::new(Matrix::column(&[first, 0.0]), covariance);

    values
        .iter()
        .map(|&z| {
            let predicted = filter.predict(&transition, &control_model, &control, &process_noise);
            match predicted.update(&Matrix::column(&[z]), &observation, &observation_noise) {
                Ok(updated) => {
                    filter = updated;
                    filter.state_estimate.get(0, 0).unwrap_or(z)
                }
                Err(e) => {
                    debug!(error = %e, "Trend smoothing skipped a sample");
                    filter = predicted;
                    z
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_scalar_converges_to_constant() {
        let mut filter = KalmanFilter::new(0.0, 1.0);
        for _ in 0..200 {
            filter = filter.predict(&1.0, &0.0, &0.0, &1e-3);
            filter = filter.update(&5.0, &1.0, &0.1).unwrap();
        }
        assert_relative_eq!(filter.state_estimate, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_scalar_singular_update() {
        let filter = KalmanFilter::new(1.0, 0.0);
        assert!(matches!(
            filter.update(&2.0, &1.0, &0.0),
            Err(CoreError::SingularCovariance)
        ));
    }

    #[test]
    fn test_matrix_inverse() {
        let m = Matrix::new(3, 3, vec![0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 3.0, 0.0, 1.0]).unwrap();
        let inv = m.inverse().unwrap();
        let product = m.checked_mul(&inv).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(product.get(i, j).unwrap(), expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_singular_matrix_has_no_inverse() {
        let m = Matrix::new(2, 2, vec![1.0, 2.0, 2.0, 4.0]).unwrap();
        assert_eq!(m.inverse(), None);
        assert_eq!(Matrix::zeros(2, 3).inverse(), None);
    }

    #[test]
    fn test_dimension_checks() {
        assert!(matches!(
            Matrix::new(2, 2, vec![1.0]),
            Err(CoreError::DimensionMismatch { .. })
        ));
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 3);
        assert!(a.checked_mul(&b).is_err());
        assert!(a.checked_add(&b).is_ok());
        assert_eq!(a.transposed().dimensions(), (3, 2));
    }

    #[test]
    fn test_addition_to_unit() {
        let m = Matrix::new(2, 2, vec![0.25, 0.5, 0.0, 1.0]).unwrap();
        let expected = Matrix::new(2, 2, vec![0.75, -0.5, 0.0, 0.0]).unwrap();
        assert_eq!(m.addition_to_unit(), expected);
        assert_relative_eq!(0.25_f64.addition_to_unit(), 0.75);
    }

    #[test]
    fn test_two_state_tracks_ramp() {
        let values: Vec<f64> = (0..120).map(|k| 2.0_f64.mul_add(f64::from(k), 100.0)).collect();
        let config = SmoothingConfig {
            model: SmoothingModel::LevelAndTrend,
            process_noise: 0.01,
            observation_noise: 0.5,
        };
        let smoothed = smooth_series(&values, &config);
        assert_eq!(smoothed.len(), values.len());
        let last = values[values.len() - 1];
        assert_relative_eq!(smoothed[smoothed.len() - 1], last, epsilon = 0.05);
    }

    #[test]
    fn test_level_smoothing_reduces_noise() {
        let values: Vec<f64> = (0..60)
            .map(|k| if k % 2 == 0 { 101.0 } else { 99.0 })
            .collect();
        let config = SmoothingConfig {
            model: SmoothingModel::Level,
            process_noise: 0.001,
            observation_noise: 1.0,
        };
        let smoothed = smooth_series(&values, &config);
        let tail = &smoothed[40..];
        assert!(tail.iter().all(|v| (v - 100.0).abs() < 0.5));
    }

    #[test]
    fn test_off_and_empty() {
        let config = SmoothingConfig::default();
        assert_eq!(smooth_series(&[1.0, 2.0], &config), vec![1.0, 2.0]);
        let level = SmoothingConfig {
            model: SmoothingModel::Level,
            ..config
        };
        assert!(smooth_series(&[], &level).is_empty());
    }
}
