//! The shared calibration algorithm behind [`Calibrator`]'s provided
//! methods.

use std::iter;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::curves::{find_new_curve, find_new_raw_curve, find_slope};
use super::regression::calculate_wls;
use super::{CalibrationInput, Calibrator, InitialCalibrationInput, ReadingInput};
use crate::config::{CalibrationSettings, PhysiologicalBounds};
use crate::kalman::{smooth_series, SmoothingConfig, SmoothingModel};
use crate::types::{millis_between, CalculatedReading, CalibrationPoint, SensorSession};

/// Raw curve estimates further than this from the adjusted raw value are
/// not trusted.
const MAX_RAW_ESTIMATE_DRIFT: f64 = 20.0;

/// Slope confidence reaches zero at this rate of change per minute.
const MAX_CONFIDENT_SLOPE: f64 = 4.0;

const INITIAL_SLOPE_CONFIDENCE: f64 = 0.5;

/// Clamps `reading.calculated_value` into the physiological range and
/// returns `true` when the value was a sensor error, in which case the
/// slope should be hidden.
pub fn update_calculated_value(
    reading: &mut CalculatedReading,
    bounds: &PhysiologicalBounds,
) -> bool {
    let value = reading.calculated_value;
    if !value.is_finite() || value < bounds.sensor_error_below {
        reading.calculated_value = bounds.sensor_error_value.max(0.0);
        return true;
    }
    reading.calculated_value = value.max(bounds.low).min(bounds.high).max(0.0);
    false
}

/// Calibration to compute new readings with: `last` unless it is flagged
/// `possibly_bad`, else the newest usable entry of `recent`.
#[must_use]
pub fn select_calibration<'c>(
    last: Option<&'c CalibrationPoint>,
    recent: &'c [CalibrationPoint],
) -> Option<&'c CalibrationPoint> {
    last.filter(|c| !c.possibly_bad)
        .or_else(|| recent.iter().find(|c| !c.possibly_bad))
}

/// Recomputes `newest` and `older` (newest first) after `calibration` was
/// created, limited to `settings.recalibration_window` readings in total.
///
/// With two or more earlier calibrations the new values are blended in,
/// fully at the newest reading and fading out across the window. With
/// exactly one the values are replaced. Without any, only `newest` is
/// recomputed and the older readings stay uncalibrated. The curves of
/// `newest` are refitted either way.
#[allow(clippy::cast_precision_loss)]
pub fn adjust_recent_readings(
    calibration: &CalibrationPoint,
    earlier_calibrations: usize,
    newest: &mut CalculatedReading,
    older: &mut [CalculatedReading],
    settings: &CalibrationSettings,
) {
    let window = settings.recalibration_window;
    let span = window.min(older.len() + 1);
    let readings = iter::once(&mut *newest).chain(older.iter_mut()).take(window);

    match earlier_calibrations {
        0 => {
            for reading in readings.take(1) {
                reading.calculated_value = calibration.apply(reading.age_adjusted_raw_value);
                let sensor_error = update_calculated_value(reading, &settings.bounds);
                reading.hide_slope |= sensor_error;
            }
        }
        1 => {
            for reading in readings {
                reading.calculated_value = calibration.apply(reading.age_adjusted_raw_value);
                let sensor_error = update_calculated_value(reading, &settings.bounds);
                reading.hide_slope |= sensor_error;
            }
        }
        _ => {
            let n = span as f64;
            for (i, reading) in readings.enumerate() {
                let i = i as f64;
                let fresh = calibration.apply(reading.age_adjusted_raw_value);
                reading.calculated_value =
                    fresh.mul_add(n - i, reading.calculated_value * i) / n;
                let sensor_error = update_calculated_value(reading, &settings.bounds);
                reading.hide_slope |= sensor_error;
            }
        }
    }
    debug!(
        earlier_calibrations,
        readings = span,
        "Recomputed recent readings"
    );

    find_new_curve(newest, older);
    find_new_raw_curve(newest, older);
}

#[allow(clippy::cast_precision_loss)]
fn millis(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64
}

fn age_adjusted<C: Calibrator + ?Sized>(
    calibrator: &C,
    raw: f64,
    sensor: Option<&SensorSession>,
    at: DateTime<Utc>,
) -> f64 {
    let Some(sensor) = sensor.filter(|_| calibrator.age_adjustment_needed()) else {
        return raw;
    };
    let settings = calibrator.settings();
    let window = millis(settings.age_adjustment_time());
    let adjust_for = window - millis_between(sensor.start_date, at);
    if adjust_for > 0.0 && window > 0.0 {
        raw + raw * settings.age_adjustment.factor * adjust_for / window
    } else {
        raw
    }
}

/// Kalman-filters the adjusted raw history ending in `adjusted` and returns
/// the posterior for the newest value.
fn smoothed(config: &SmoothingConfig, prior: &[CalculatedReading], adjusted: f64) -> f64 {
    if config.model == SmoothingModel::Off {
        return adjusted;
    }
    let series: Vec<f64> = prior
        .iter()
        .rev()
        .map(|r| r.age_adjusted_raw_value)
        .filter(|v| v.is_finite())
        .chain(iter::once(adjusted))
        .collect();
    smooth_series(&series, config)
        .last()
        .copied()
        .unwrap_or(adjusted)
}

fn new_reading(input: &ReadingInput<'_>) -> CalculatedReading {
    let mut reading = CalculatedReading::new(input.timestamp.unwrap_or_else(Utc::now), 0.0);
    reading.sensor_id = input.sensor.map(|s| s.id);
    reading.device_name = input.device_name.map(str::to_owned);
    reading
}

fn fit_curves_and_slope(
    reading: &mut CalculatedReading,
    prior: &[CalculatedReading],
    settings: &CalibrationSettings,
) -> bool {
    find_new_curve(reading, prior);
    find_new_raw_curve(reading, prior);
    find_slope(reading, prior, settings.max_slope_gap_minutes)
}

pub(super) fn build_reading<C: Calibrator + ?Sized>(
    calibrator: &C,
    input: &ReadingInput<'_>,
) -> CalculatedReading {
    let mut reading = new_reading(input);
    let settings = calibrator.settings();

    if !(input.raw_data.is_finite() && input.raw_data > 0.0) {
        debug!(raw = input.raw_data, "Raw value is not positive, passing through");
        let echoed = if input.raw_data.is_finite() {
            input.raw_data.max(0.0)
        } else {
            0.0
        };
        reading.raw_value = echoed;
        reading.age_adjusted_raw_value = echoed;
        reading.calculated_value = echoed;
        reading.c = echoed;
        reading.rc = echoed;
        return reading;
    }

    let raw = input.raw_data / calibrator.raw_value_divider();
    reading.raw_value = raw;
    reading.age_adjusted_raw_value = age_adjusted(calibrator, raw, input.sensor, reading.timestamp);

    let prior = input.recent_readings;
    let calibration = select_calibration(input.last_calibration, input.recent_calibrations);
    let sensor_error = match calibration {
        None => {
            reading.calculated_value = input.raw_data;
            false
        }
        Some(calibration) => {
            let basis = smoothed(&settings.smoothing, prior, reading.age_adjusted_raw_value);
            reading.calculated_value = calibration.apply(basis);
            reading.calibration_id = Some(calibration.id);
            update_calculated_value(&mut reading, &settings.bounds)
        }
    };

    let slope_hidden = fit_curves_and_slope(&mut reading, prior, settings);
    reading.hide_slope = sensor_error || slope_hidden;
    reading
}

/// Reading for calibrators that echo the raw value untouched.
pub(super) fn build_passthrough_reading(
    input: &ReadingInput<'_>,
    settings: &CalibrationSettings,
) -> CalculatedReading {
    let mut reading = new_reading(input);
    reading.raw_value = input.raw_data;
    reading.age_adjusted_raw_value = input.raw_data;
    reading.calculated_value = input.raw_data;
    reading.hide_slope = fit_curves_and_slope(&mut reading, input.recent_readings, settings);
    reading
}

fn sensor_confidence(bg: f64) -> f64 {
    ((-0.0018_f64).mul_add(bg * bg, 0.6657_f64.mul_add(bg, 36.7505)) / 100.0).max(0.0)
}

pub(super) fn build_calibration<C: Calibrator + ?Sized>(
    calibrator: &C,
    input: CalibrationInput<'_>,
) -> Option<CalibrationPoint> {
    let CalibrationInput {
        bg_value,
        timestamp,
        last_reading,
        sensor,
        recent_calibrations,
        first_calibration,
        recent_readings,
        device_name,
    } = input;

    let Some(sensor) = sensor else {
        debug!("No sensor, cannot calibrate");
        return None;
    };
    let Some(reading) = last_reading else {
        debug!("No reading to pair the calibration with");
        return None;
    };
    if !(bg_value.is_finite() && bg_value > 0.0) {
        debug!(bg_value, "Ignoring non-positive blood glucose value");
        return None;
    }
    let timestamp = timestamp.unwrap_or_else(Utc::now);

    let slope_confidence =
        (MAX_CONFIDENT_SLOPE - reading.calculated_value_slope.abs()) / MAX_CONFIDENT_SLOPE;
    let mut point = CalibrationPoint::new(
        timestamp,
        bg_value,
        slope_confidence,
        sensor_confidence(bg_value),
    );
    let adjusted = reading.age_adjusted_raw_value;
    let estimate = reading.estimate_raw_at(timestamp);
    point.raw_value_at_calibration = reading.raw_value;
    point.adjusted_raw_value_at_calibration = adjusted;
    point.estimate_raw_at_calibration =
        if estimate.is_finite() && (estimate - adjusted).abs() <= MAX_RAW_ESTIMATE_DRIFT {
            estimate
        } else {
            adjusted
        };
    point.raw_timestamp = reading.timestamp;
    point.distance_from_estimate = (bg_value - reading.calculated_value).abs();
    point.sensor_age_at_calibration = sensor.age_at(timestamp);
    point.device_name = device_name.map(str::to_owned);

    calculate_wls(
        &mut point,
        recent_calibrations,
        first_calibration,
        calibrator.slope_parameters(),
        calibrator.settings(),
    );

    reading.calibration_flag = true;
    reading.calibration_id = Some(point.id);
    let earlier = recent_calibrations
        .iter()
        .filter(|c| !c.possibly_bad && c.id != point.id)
        .count();
    adjust_recent_readings(&point, earlier, reading, recent_readings, calibrator.settings());

    info!(
        calibrator = calibrator.description(),
        bg = point.bg_value,
        slope = point.slope,
        intercept = point.intercept,
        possibly_bad = point.possibly_bad,
        "New calibration"
    );
    Some(point)
}

fn seed_point(
    bg_value: f64,
    timestamp: DateTime<Utc>,
    reading: &CalculatedReading,
    sensor: &SensorSession,
    device_name: Option<&str>,
) -> CalibrationPoint {
    let mut point = CalibrationPoint::new(
        timestamp,
        bg_value,
        INITIAL_SLOPE_CONFIDENCE,
        sensor_confidence(bg_value),
    );
    point.raw_value_at_calibration = reading.raw_value;
    point.adjusted_raw_value_at_calibration = reading.age_adjusted_raw_value;
    point.estimate_raw_at_calibration = reading.age_adjusted_raw_value;
    point.raw_timestamp = reading.timestamp;
    point.sensor_age_at_calibration = sensor.age_at(timestamp);
    point.device_name = device_name.map(str::to_owned);
    point
}

pub(super) fn build_initial<C: Calibrator + ?Sized>(
    calibrator: &C,
    input: InitialCalibrationInput<'_>,
) -> Option<(CalibrationPoint, CalibrationPoint)> {
    let InitialCalibrationInput {
        first_value,
        first_timestamp,
        second_value,
        sensor,
        recent_zero_readings: readings,
        device_name,
    } = input;

    let Some(sensor) = sensor else {
        debug!("No sensor, cannot run initial calibration");
        return None;
    };
    if readings.len() < 2 {
        debug!(readings = readings.len(), "Initial calibration needs two readings");
        return None;
    }
    let valid = |v: f64| v.is_finite() && v > 0.0;
    if !(valid(first_value) && valid(second_value)) {
        debug!(first_value, second_value, "Ignoring non-positive blood glucose values");
        return None;
    }

    // Higher blood glucose goes with the higher raw value.
    let newest_higher = readings[0].age_adjusted_raw_value >= readings[1].age_adjusted_raw_value;
    let (first_index, second_index) = if newest_higher == (first_value >= second_value) {
        (0, 1)
    } else {
        (1, 0)
    };

    let first_at = first_timestamp + Duration::minutes(5);
    let second_at = readings[0].timestamp.max(first_at);
    let mut first = seed_point(first_value, first_at, &readings[first_index], sensor, device_name);
    let mut second = seed_point(
        second_value,
        second_at,
        &readings[second_index],
        sensor,
        device_name,
    );

    let params = calibrator.slope_parameters();
    let settings = calibrator.settings();
    calculate_wls(&mut first, &[], None, params, settings);
    calculate_wls(
        &mut second,
        std::slice::from_ref(&first),
        Some(&first),
        params,
        settings,
    );

    for (index, point) in [(first_index, &first), (second_index, &second)] {
        let reading = &mut readings[index];
        reading.calculated_value = point.bg_value;
        reading.calibration_flag = true;
        reading.calibration_id = Some(point.id);
    }
    for index in [1, 0] {
        let (head, older) = readings.split_at_mut(index + 1);
        let reading = &mut head[index];
        find_new_curve(reading, older);
        find_new_raw_curve(reading, older);
    }

    info!(
        calibrator = calibrator.description(),
        first_bg = first.bg_value,
        second_bg = second.bg_value,
        slope = second.slope,
        intercept = second.intercept,
        "Initial calibration"
    );
    Some((first, second))
}
