//! Value types exchanged between the core and its caller.
//!
//! The core never owns persisted history. Callers hand in slices of these
//! types (newest first) and receive new values back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::TransmitterClock;
use crate::wire::dexcom::SensorDataRx;

/// An unscaled measurement decoded from a transmitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Wall-clock time of the measurement.
    pub timestamp: DateTime<Utc>,

    /// Unscaled raw count.
    pub raw_value: f64,

    /// Filtered raw count, for transmitters that report one.
    pub filtered_value: Option<f64>,

    /// Transmitter status byte at measurement time.
    pub status: u8,
}

impl RawSample {
    /// Builds a sample from a sensor data response, placing it on the wall
    /// clock with `clock`.
    #[must_use]
    pub fn from_sensor_data(message: &SensorDataRx, clock: &TransmitterClock) -> Self {
        Self {
            timestamp: clock.to_wall_clock(message.timestamp),
            raw_value: f64::from(message.unfiltered),
            filtered_value: message.filtered.map(f64::from),
            status: message.status,
        }
    }
}

/// A finger-stick blood glucose value paired with the sensor reading it was
/// taken against, together with the linear model fitted at that time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Unique identifier.
    pub id: Uuid,

    /// When the finger-stick value applies.
    pub timestamp: DateTime<Utc>,

    /// Finger-stick blood glucose.
    pub bg_value: f64,

    /// Scaled raw value of the paired reading.
    pub raw_value_at_calibration: f64,

    /// Age-adjusted raw value of the paired reading.
    pub adjusted_raw_value_at_calibration: f64,

    /// Raw value the paired reading's curve predicts at `timestamp`.
    pub estimate_raw_at_calibration: f64,

    /// Timestamp of the paired reading.
    pub raw_timestamp: DateTime<Utc>,

    /// Fitted slope.
    pub slope: f64,

    /// Fitted intercept.
    pub intercept: f64,

    /// Absolute difference between `bg_value` and what the sensor showed.
    pub distance_from_estimate: f64,

    /// Confidence derived from how fast glucose was changing, in `[0, 1]`.
    pub slope_confidence: f64,

    /// Confidence derived from the blood glucose level, in `[0, 1]`.
    pub sensor_confidence: f64,

    /// Sensor age when the calibration was entered.
    #[serde(with = "duration_millis")]
    pub sensor_age_at_calibration: Duration,

    /// Excluded from fitting and from reading computation.
    pub possibly_bad: bool,

    /// Device the paired reading came from.
    pub device_name: Option<String>,
}

impl CalibrationPoint {
    /// Creates a calibration with a neutral model (`slope = 1`,
    /// `intercept = 0`) and both confidences clamped into `[0, 1]`.
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        bg_value: f64,
        slope_confidence: f64,
        sensor_confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            bg_value,
            raw_value_at_calibration: 0.0,
            adjusted_raw_value_at_calibration: 0.0,
            estimate_raw_at_calibration: 0.0,
            raw_timestamp: timestamp,
            slope: 1.0,
            intercept: 0.0,
            distance_from_estimate: 0.0,
            slope_confidence: clamp_unit(slope_confidence),
            sensor_confidence: clamp_unit(sensor_confidence),
            sensor_age_at_calibration: Duration::zero(),
            possibly_bad: false,
            device_name: None,
        }
    }

    /// Flags the calibration so it is no longer used.
    pub fn mark_possibly_bad(&mut self) {
        self.possibly_bad = true;
    }

    /// Applies the fitted model to an adjusted raw value.
    #[must_use]
    pub fn apply(&self, adjusted_raw: f64) -> f64 {
        adjusted_raw.mul_add(self.slope, self.intercept)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// A glucose value computed from one raw sample.
///
/// Curve coefficients describe a quadratic over minutes relative to this
/// reading's own timestamp, so `c` is the value at the reading and `b` the
/// slope of the curve there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedReading {
    /// Unique identifier.
    pub id: Uuid,

    /// When the raw sample was measured.
    pub timestamp: DateTime<Utc>,

    /// Raw value scaled by the calibrator's divider.
    pub raw_value: f64,

    /// Raw value after early-sensor age adjustment.
    pub age_adjusted_raw_value: f64,

    /// Calibrated glucose value.
    pub calculated_value: f64,

    /// Rate of change of `calculated_value` per minute.
    pub calculated_value_slope: f64,

    /// The slope is not trustworthy and should not be shown.
    pub hide_slope: bool,

    /// Quadratic coefficient of the calculated value curve.
    pub a: f64,
    /// Linear coefficient of the calculated value curve.
    pub b: f64,
    /// Constant coefficient of the calculated value curve.
    pub c: f64,

    /// Quadratic coefficient of the adjusted raw curve.
    pub ra: f64,
    /// Linear coefficient of the adjusted raw curve.
    pub rb: f64,
    /// Constant coefficient of the adjusted raw curve.
    pub rc: f64,

    /// Calibration used to compute the value.
    pub calibration_id: Option<Uuid>,

    /// This reading was paired with a finger-stick value.
    pub calibration_flag: bool,

    /// Sensor session the reading belongs to.
    pub sensor_id: Option<Uuid>,

    /// Device the raw sample came from.
    pub device_name: Option<String>,
}

impl CalculatedReading {
    /// Creates an uncalibrated reading with flat curves.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, raw_value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            raw_value,
            age_adjusted_raw_value: raw_value,
            calculated_value: 0.0,
            calculated_value_slope: 0.0,
            hide_slope: true,
            a: 0.0,
            b: 0.0,
            c: 0.0,
            ra: 0.0,
            rb: 0.0,
            rc: raw_value,
            calibration_id: None,
            calibration_flag: false,
            sensor_id: None,
            device_name: None,
        }
    }

    /// Minutes from this reading to `at`.
    #[must_use]
    pub fn minutes_until(&self, at: DateTime<Utc>) -> f64 {
        millis_between(self.timestamp, at) / 60_000.0
    }

    /// Calculated value predicted by the curve at `at`.
    #[must_use]
    pub fn estimate_at(&self, at: DateTime<Utc>) -> f64 {
        let m = self.minutes_until(at);
        self.a.mul_add(m * m, self.b.mul_add(m, self.c))
    }

    /// Adjusted raw value predicted by the raw curve at `at`.
    #[must_use]
    pub fn estimate_raw_at(&self, at: DateTime<Utc>) -> f64 {
        let m = self.minutes_until(at);
        self.ra.mul_add(m * m, self.rb.mul_add(m, self.rc))
    }
}

/// A sensor wear period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSession {
    /// Unique identifier.
    pub id: Uuid,

    /// When the sensor was inserted.
    pub start_date: DateTime<Utc>,

    /// When the sensor was stopped, if it has been.
    pub end_date: Option<DateTime<Utc>>,
}

impl SensorSession {
    /// Starts a new session at `start_date`.
    #[must_use]
    pub fn start(start_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_date,
            end_date: None,
        }
    }

    /// Ends the session at `at`.
    pub fn stop(&mut self, at: DateTime<Utc>) {
        self.end_date = Some(at);
    }

    /// Returns `true` while the sensor has not been stopped.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.end_date.is_none()
    }

    /// Sensor age at `at`.
    #[must_use]
    pub fn age_at(&self, at: DateTime<Utc>) -> Duration {
        at - self.start_date
    }

    /// Returns `true` if `at` falls inside the wear period.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_date && self.end_date.map_or(true, |end| at <= end)
    }
}

/// Milliseconds from `from` to `to` as a float.
#[must_use]
pub fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64
}

mod duration_millis {
    use chrono::Duration;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_milliseconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        Ok(Duration::milliseconds(millis))
    }
}
