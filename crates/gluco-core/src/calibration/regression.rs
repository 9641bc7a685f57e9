//! Weighted least-squares fit of the slope/intercept model.
//!
//! Every calibration inside the fitting window contributes one weighted
//! point `(estimate_raw_at_calibration, bg_value)`. Weights grow with both
//! confidences and with how recent the calibration is within the sensor's
//! life, and the newest calibration is counted a second time so a fresh
//! finger stick dominates older ones.

use chrono::Duration;
use tracing::{debug, warn};

use super::slope::SlopeParameters;
use crate::config::CalibrationSettings;
use crate::types::CalibrationPoint;

const DEGENERATE_TOLERANCE: f64 = 1e-9;
const NEWEST_EXTRA_WEIGHT: f64 = 0.14;
const TIME_WEIGHT_SPREAD: f64 = 0.85;
const TRUSTED_DISTANCE: f64 = 30.0;

#[allow(clippy::cast_precision_loss)]
fn millis(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64
}

/// Time-of-life weighting between the first and the newest calibration.
#[derive(Debug, Clone, Copy)]
struct TimeWeights {
    first: Duration,
    last: Duration,
}

impl TimeWeights {
    fn time_pct(&self, age: Duration) -> f64 {
        if self.first == self.last {
            return 1.01;
        }
        let fraction = millis(age - self.first) / millis(self.last - self.first);
        (fraction / TIME_WEIGHT_SPREAD).min(1.0) + 0.01
    }

    fn weight(&self, calibration: &CalibrationPoint) -> f64 {
        let confidence = calibration.slope_confidence + calibration.sensor_confidence;
        (confidence * self.time_pct(calibration.sensor_age_at_calibration) / 2.0 * 100.0).max(1.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WeightedSums {
    w: f64,
    wx: f64,
    wxx: f64,
    wy: f64,
    wxy: f64,
}

impl WeightedSums {
    fn add(&mut self, x: f64, y: f64, weight: f64) {
        self.w += weight;
        self.wx += weight * x;
        self.wxx += weight * x * x;
        self.wy += weight * y;
        self.wxy += weight * x * y;
    }

    /// Solves the normal equations, or `None` when every `x` coincides.
    fn solve(&self) -> Option<(f64, f64)> {
        let d = self.w.mul_add(self.wxx, -(self.wx * self.wx));
        if !d.is_finite() || d.abs() <= DEGENERATE_TOLERANCE * self.w * self.wxx {
            return None;
        }
        let slope = self.w.mul_add(self.wxy, -(self.wx * self.wy)) / d;
        let intercept = self.wxx.mul_add(self.wy, -(self.wx * self.wxy)) / d;
        Some((slope, intercept))
    }

    fn mean_x(&self) -> f64 {
        self.wx / self.w
    }

    fn mean_y(&self) -> f64 {
        self.wy / self.w
    }
}

/// Fits `point.slope` and `point.intercept` from `point` and the usable
/// calibrations in `recent` (newest first), then bounds the slope.
///
/// Calibrations flagged `possibly_bad` or older than the calibration window
/// are ignored. `first` anchors the time weighting; without it the oldest
/// considered calibration is used.
pub fn calculate_wls(
    point: &mut CalibrationPoint,
    recent: &[CalibrationPoint],
    first: Option<&CalibrationPoint>,
    params: &SlopeParameters,
    settings: &CalibrationSettings,
) {
    let window = settings.calibration_window();
    let earlier: Vec<&CalibrationPoint> = recent
        .iter()
        .filter(|c| c.id != point.id && !c.possibly_bad && point.timestamp - c.timestamp <= window)
        .collect();
    let count = earlier.len() + 1;

    if count == 1 {
        point.slope = params.default_slope;
        point.intercept = intercept_through(point, point.slope);
        debug!(
            slope = point.slope,
            intercept = point.intercept,
            "Single calibration, using default slope"
        );
        return;
    }

    let first_age = first.map_or_else(
        || {
            earlier
                .iter()
                .map(|c| c.sensor_age_at_calibration)
                .chain(std::iter::once(point.sensor_age_at_calibration))
                .min()
                .unwrap_or(point.sensor_age_at_calibration)
        },
        |c| c.sensor_age_at_calibration,
    );
    let weights = TimeWeights {
        first: first_age,
        last: point.sensor_age_at_calibration,
    };

    let mut sums = WeightedSums::default();
    for calibration in &earlier {
        sums.add(
            calibration.estimate_raw_at_calibration,
            calibration.bg_value,
            weights.weight(calibration),
        );
    }
    let newest_weight = weights.weight(point);
    #[allow(clippy::cast_precision_loss)]
    let extra_weight = newest_weight * count as f64 * NEWEST_EXTRA_WEIGHT;
    sums.add(point.estimate_raw_at_calibration, point.bg_value, newest_weight);
    sums.add(point.estimate_raw_at_calibration, point.bg_value, extra_weight);

    let (slope, intercept) = sums.solve().unwrap_or_else(|| {
        debug!(count, "Calibration raw values coincide, using default slope");
        let slope = params.default_slope;
        (slope, (-slope).mul_add(sums.mean_x(), sums.mean_y()))
    });
    point.slope = slope;
    point.intercept = intercept;
    debug!(count, slope, intercept, "Fitted calibration");

    let previous = recent.iter().find(|c| c.id != point.id);
    bound_slope(point, previous, count, params);
}

fn intercept_through(point: &CalibrationPoint, slope: f64) -> f64 {
    (-point.adjusted_raw_value_at_calibration).mul_add(slope, point.bg_value)
}

/// Replaces an implausible slope and refits the intercept through the new
/// calibration. Outside the hard bounds the default slope is used and, once
/// more than two calibrations exist, the calibration is flagged
/// `possibly_bad`. Soft excursions are pulled back towards the soft bounds.
fn bound_slope(
    point: &mut CalibrationPoint,
    previous: Option<&CalibrationPoint>,
    count: usize,
    params: &SlopeParameters,
) {
    let fitted = point.slope;
    let age_days = millis(point.sensor_age_at_calibration) / 86_400_000.0;
    let age_slope = (-0.048_f64).mul_add(age_days, 1.1);

    let replacement = if !params.within_hard_bounds(fitted) {
        // Fixed-slope families always land here and are not suspect.
        if count > 2 && params.low_slope_2 < params.high_slope_2 {
            point.mark_possibly_bad();
        }
        Some(params.default_slope)
    } else if params.within_soft_bounds(fitted) {
        None
    } else if count == 2 {
        Some(if fitted < params.low_slope_1 {
            age_slope.max(params.default_low_slope_high)
        } else {
            params.default_high_slope_low
        })
    } else {
        match previous {
            Some(prev) if prev.possibly_bad && point.distance_from_estimate < TRUSTED_DISTANCE => {
                Some(prev.slope)
            }
            _ if fitted < params.low_slope_1 => Some(age_slope.max(params.default_low_slope_low)),
            _ => Some(params.default_high_slope_high),
        }
    };

    if let Some(slope) = replacement {
        point.slope = slope;
        point.intercept = intercept_through(point, slope);
        warn!(
            fitted,
            slope,
            intercept = point.intercept,
            calibrations = count,
            possibly_bad = point.possibly_bad,
            "Fitted slope out of bounds, replaced"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn point(minutes: i64, raw: f64, bg: f64) -> CalibrationPoint {
        let mut p = CalibrationPoint::new(at(minutes), bg, 1.0, 0.8);
        p.raw_value_at_calibration = raw;
        p.adjusted_raw_value_at_calibration = raw;
        p.estimate_raw_at_calibration = raw;
        p.sensor_age_at_calibration = Duration::days(3) + Duration::minutes(minutes);
        p
    }

    fn fit(p: &mut CalibrationPoint, recent: &[CalibrationPoint]) {
        calculate_wls(
            p,
            recent,
            recent.last(),
            &SlopeParameters::DEXCOM,
            &CalibrationSettings::default(),
        );
    }

    #[test]
    fn test_single_calibration_uses_default_slope() {
        let mut p = point(0, 100.0, 120.0);
        fit(&mut p, &[]);
        assert_relative_eq!(p.slope, 1.0);
        assert_relative_eq!(p.intercept, 20.0);
        assert!(!p.possibly_bad);
    }

    #[test]
    fn test_two_points_fit_exactly() {
        let mut first = point(0, 100.0, 100.0);
        fit(&mut first, &[]);
        let mut second = point(60, 200.0, 210.0);
        fit(&mut second, &[first]);
        assert_relative_eq!(second.slope, 1.1, epsilon = 1e-9);
        assert_relative_eq!(second.intercept, -10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_hard_bound_falls_back_to_default_slope() {
        let first = point(0, 100.0, 100.0);
        let mut second = point(60, 110.0, 300.0);
        fit(&mut second, &[first]);
        assert_relative_eq!(second.slope, 1.0);
        assert_relative_eq!(second.intercept, 190.0, epsilon = 1e-9);
        assert!(!second.possibly_bad);
    }

    #[test]
    fn test_hard_bound_with_history_flags_possibly_bad() {
        let first = point(0, 100.0, 100.0);
        let second = point(60, 150.0, 150.0);
        let mut third = point(120, 160.0, 400.0);
        fit(&mut third, &[second, first]);
        assert_relative_eq!(third.slope, 1.0);
        assert!(third.possibly_bad);
    }

    #[test]
    fn test_fixed_slope_never_flags() {
        let settings = CalibrationSettings::default();
        let first = point(0, 100.0, 100.0);
        let second = point(60, 150.0, 170.0);
        let mut third = point(120, 160.0, 190.0);
        calculate_wls(
            &mut third,
            &[second, first.clone()],
            Some(&first),
            &SlopeParameters::LIBRE1_FIXED,
            &settings,
        );
        assert_relative_eq!(third.slope, 1.0);
        assert_relative_eq!(third.intercept, 30.0, epsilon = 1e-9);
        assert!(!third.possibly_bad);
    }

    #[test]
    fn test_soft_excursion_with_two_calibrations() {
        let first = point(0, 100.0, 100.0);
        let mut high = point(60, 200.0, 235.0);
        fit(&mut high, &[first.clone()]);
        assert_relative_eq!(high.slope, SlopeParameters::DEXCOM.default_high_slope_low);
        assert_relative_eq!(high.intercept, -5.0, epsilon = 1e-9);

        let mut low = point(60, 200.0, 172.0);
        fit(&mut low, &[first]);
        // Three days in: max(-0.048 * 3.04 + 1.1, 0.70)
        let age_days = 3.0 + 60.0 / 1440.0;
        assert_relative_eq!(low.slope, (-0.048f64).mul_add(age_days, 1.1), epsilon = 1e-9);
    }

    #[test]
    fn test_soft_excursion_reuses_slope_after_bad_calibration() {
        let first = point(0, 100.0, 100.0);
        let mut bad = point(60, 150.0, 150.0);
        bad.slope = 0.8;
        bad.mark_possibly_bad();
        // Collinear with slope 1.35, inside the hard bounds only.
        let second = point(30, 120.0, 127.0);
        let mut third = point(120, 200.0, 235.0);
        third.distance_from_estimate = 5.0;
        fit(&mut third, &[bad, second, first]);
        assert_relative_eq!(third.slope, 0.8);
    }

    #[test]
    fn test_possibly_bad_and_stale_calibrations_are_ignored() {
        let mut stale = point(-10 * 24 * 60, 100.0, 400.0);
        stale.sensor_age_at_calibration = Duration::zero();
        let mut bad = point(30, 100.0, 10.0);
        bad.mark_possibly_bad();
        let mut p = point(60, 100.0, 120.0);
        fit(&mut p, &[bad, stale]);
        assert_relative_eq!(p.slope, 1.0);
        assert_relative_eq!(p.intercept, 20.0);
    }

    #[test]
    fn test_coincident_raw_values_use_weighted_mean() {
        let first = point(0, 100.0, 100.0);
        let mut second = point(60, 100.0, 110.0);
        fit(&mut second, &[first]);
        assert_relative_eq!(second.slope, 1.0);
        assert!(second.intercept > 0.0 && second.intercept < 10.0);
    }

    #[test]
    fn test_time_pct() {
        let weights = TimeWeights {
            first: Duration::days(1),
            last: Duration::days(3),
        };
        assert_relative_eq!(weights.time_pct(Duration::days(1)), 0.01);
        assert_relative_eq!(weights.time_pct(Duration::days(3)), 1.01);
        assert_relative_eq!(weights.time_pct(Duration::days(2)), 0.5 / 0.85 + 0.01);

        let same = TimeWeights {
            first: Duration::days(2),
            last: Duration::days(2),
        };
        assert_relative_eq!(same.time_pct(Duration::days(2)), 1.01);
    }
}
