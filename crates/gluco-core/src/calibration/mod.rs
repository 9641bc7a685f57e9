//! Calibration engine.
//!
//! Turns scaled raw sensor values into glucose values with a linear
//! `slope · raw + intercept` model fitted to finger-stick calibrations.
//! One [`Calibrator`] implementation exists per sensor family; they share
//! the algorithm and differ in raw value divider, early-sensor age
//! adjustment and [`SlopeParameters`].
//!
//! The engine owns no history. Callers pass recent readings and
//! calibrations in (newest first) and persist whatever comes back.
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use gluco_core::calibration::{CalibrationInput, Calibrator, DexcomCalibrator, ReadingInput};
//! use gluco_core::types::SensorSession;
//!
//! let now = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
//! let sensor = SensorSession::start(now - Duration::days(3));
//! let calibrator = DexcomCalibrator::default();
//!
//! let mut reading = calibrator.create_new_bg_reading(ReadingInput {
//!     timestamp: Some(now),
//!     sensor: Some(&sensor),
//!     ..ReadingInput::new(120_000.0)
//! });
//! // Uncalibrated readings pass the raw value through.
//! assert_eq!(reading.calculated_value, 120_000.0);
//!
//! let calibration = calibrator
//!     .create_new_calibration(CalibrationInput {
//!         timestamp: Some(now),
//!         last_reading: Some(&mut reading),
//!         sensor: Some(&sensor),
//!         ..CalibrationInput::new(110.0)
//!     })
//!     .unwrap();
//! assert_eq!(calibration.slope, 1.0);
//! ```

use chrono::{DateTime, Utc};

use crate::config::CalibrationSettings;
use crate::types::{CalculatedReading, CalibrationPoint, SensorSession};

pub mod curves;
mod engine;
pub mod regression;
pub mod slope;
mod variants;

pub use engine::{adjust_recent_readings, select_calibration, update_calculated_value};
pub use slope::SlopeParameters;
pub use variants::{
    CalibratorKind, DexcomCalibrator, Libre1Calibrator, Libre1NonFixedSlopeCalibrator,
    LibreOopCalibrator, NoCalibrator,
};

/// Inputs for [`Calibrator::create_new_bg_reading`].
#[derive(Debug, Clone, Copy)]
pub struct ReadingInput<'a> {
    /// Unscaled raw value from the transmitter.
    pub raw_data: f64,
    /// Measurement time, defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Active sensor, needed for age adjustment.
    pub sensor: Option<&'a SensorSession>,
    /// Earlier readings, newest first.
    pub recent_readings: &'a [CalculatedReading],
    /// Earlier calibrations, newest first.
    pub recent_calibrations: &'a [CalibrationPoint],
    /// First calibration of the sensor session.
    pub first_calibration: Option<&'a CalibrationPoint>,
    /// Calibration the caller considers current.
    pub last_calibration: Option<&'a CalibrationPoint>,
    /// Source device.
    pub device_name: Option<&'a str>,
}

impl ReadingInput<'_> {
    /// Input with no history.
    #[must_use]
    pub const fn new(raw_data: f64) -> Self {
        Self {
            raw_data,
            timestamp: None,
            sensor: None,
            recent_readings: &[],
            recent_calibrations: &[],
            first_calibration: None,
            last_calibration: None,
            device_name: None,
        }
    }
}

/// Inputs for [`Calibrator::create_new_calibration`].
///
/// `last_reading` is the reading the finger stick is paired with and
/// `recent_readings` the readings before it, newest first. Both are
/// updated in place by the re-calibration pass.
#[derive(Debug)]
pub struct CalibrationInput<'a> {
    /// Finger-stick blood glucose.
    pub bg_value: f64,
    /// When the finger stick was taken, defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Reading to pair the finger stick with.
    pub last_reading: Option<&'a mut CalculatedReading>,
    /// Active sensor.
    pub sensor: Option<&'a SensorSession>,
    /// Earlier calibrations, newest first.
    pub recent_calibrations: &'a [CalibrationPoint],
    /// First calibration of the sensor session.
    pub first_calibration: Option<&'a CalibrationPoint>,
    /// Readings older than `last_reading`, newest first.
    pub recent_readings: &'a mut [CalculatedReading],
    /// Source device.
    pub device_name: Option<&'a str>,
}

impl CalibrationInput<'_> {
    /// Input with no reading and no history.
    #[must_use]
    pub fn new(bg_value: f64) -> Self {
        Self {
            bg_value,
            timestamp: None,
            last_reading: None,
            sensor: None,
            recent_calibrations: &[],
            first_calibration: None,
            recent_readings: &mut [],
            device_name: None,
        }
    }
}

/// Inputs for [`Calibrator::initial_calibration`].
#[derive(Debug)]
pub struct InitialCalibrationInput<'a> {
    /// First finger-stick value.
    pub first_value: f64,
    /// When the first finger stick was taken.
    pub first_timestamp: DateTime<Utc>,
    /// Second finger-stick value.
    pub second_value: f64,
    /// Active sensor.
    pub sensor: Option<&'a SensorSession>,
    /// Uncalibrated readings since the sensor started, newest first.
    pub recent_zero_readings: &'a mut [CalculatedReading],
    /// Source device.
    pub device_name: Option<&'a str>,
}

/// A calibration strategy for one sensor family.
///
/// Implementors supply the family constants; the algorithm itself is
/// provided and shared.
pub trait Calibrator {
    /// Stable identifier, for example `"DexcomCalibrator"`.
    fn description(&self) -> &'static str;

    /// Raw values are divided by this before any computation.
    fn raw_value_divider(&self) -> f64;

    /// Whether early-sensor age adjustment applies.
    fn age_adjustment_needed(&self) -> bool;

    /// Slope bounds of the family.
    fn slope_parameters(&self) -> &SlopeParameters;

    /// Shared engine settings.
    fn settings(&self) -> &CalibrationSettings;

    /// Builds a reading from a raw value.
    ///
    /// Without a usable calibration `calculated_value` is the unscaled raw
    /// value. Otherwise the current model is applied and the result clamped
    /// into the physiological range. Curves and slope are fitted against
    /// the two newest prior readings.
    fn create_new_bg_reading(&self, input: ReadingInput<'_>) -> CalculatedReading {
        engine::build_reading(self, &input)
    }

    /// Records a finger-stick value against `input.last_reading`, refits the
    /// model and recomputes recent readings.
    ///
    /// Returns `None` without a sensor or reading, or for a non-positive
    /// blood glucose value.
    fn create_new_calibration(&self, input: CalibrationInput<'_>) -> Option<CalibrationPoint> {
        engine::build_calibration(self, input)
    }

    /// Creates the two calibrations that start a sensor session from two
    /// finger sticks and the uncalibrated readings collected so far.
    ///
    /// Returns `None` with fewer than two readings or without a sensor.
    fn initial_calibration(
        &self,
        input: InitialCalibrationInput<'_>,
    ) -> Option<(CalibrationPoint, CalibrationPoint)> {
        engine::build_initial(self, input)
    }
}
