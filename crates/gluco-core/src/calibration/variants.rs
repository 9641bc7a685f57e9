//! Calibrator implementations per sensor family.

use super::engine::build_passthrough_reading;
use super::slope::SlopeParameters;
use super::{CalibrationInput, Calibrator, InitialCalibrationInput, ReadingInput};
use crate::config::CalibrationSettings;
use crate::types::{CalculatedReading, CalibrationPoint};

/// Divider that turns Dexcom and Libre 1 raw counts into model units.
const RAW_COUNT_DIVIDER: f64 = 1000.0;

/// Dexcom G5/G6. Raw counts are divided by 1000 and freshly inserted
/// sensors get an age adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct DexcomCalibrator {
    slope: SlopeParameters,
    settings: CalibrationSettings,
}

impl DexcomCalibrator {
    /// Creates the calibrator.
    #[must_use]
    pub const fn new(slope: SlopeParameters, settings: CalibrationSettings) -> Self {
        Self { slope, settings }
    }
}

impl Default for DexcomCalibrator {
    fn default() -> Self {
        Self::new(SlopeParameters::DEXCOM, CalibrationSettings::default())
    }
}

impl Calibrator for DexcomCalibrator {
    fn description(&self) -> &'static str {
        "DexcomCalibrator"
    }

    fn raw_value_divider(&self) -> f64 {
        RAW_COUNT_DIVIDER
    }

    fn age_adjustment_needed(&self) -> bool {
        true
    }

    fn slope_parameters(&self) -> &SlopeParameters {
        &self.slope
    }

    fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }
}

/// Libre 1 through a bridge, slope pinned to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Libre1Calibrator {
    slope: SlopeParameters,
    settings: CalibrationSettings,
}

impl Libre1Calibrator {
    /// Creates the calibrator.
    #[must_use]
    pub const fn new(slope: SlopeParameters, settings: CalibrationSettings) -> Self {
        Self { slope, settings }
    }
}

impl Default for Libre1Calibrator {
    fn default() -> Self {
        Self::new(SlopeParameters::LIBRE1_FIXED, CalibrationSettings::default())
    }
}

impl Calibrator for Libre1Calibrator {
    fn description(&self) -> &'static str {
        "Libre1Calibrator"
    }

    fn raw_value_divider(&self) -> f64 {
        RAW_COUNT_DIVIDER
    }

    fn age_adjustment_needed(&self) -> bool {
        false
    }

    fn slope_parameters(&self) -> &SlopeParameters {
        &self.slope
    }

    fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }
}

/// Libre 1 through a bridge with a fitted slope kept within wide bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Libre1NonFixedSlopeCalibrator {
    slope: SlopeParameters,
    settings: CalibrationSettings,
}

impl Libre1NonFixedSlopeCalibrator {
    /// Creates the calibrator.
    #[must_use]
    pub const fn new(slope: SlopeParameters, settings: CalibrationSettings) -> Self {
        Self { slope, settings }
    }
}

impl Default for Libre1NonFixedSlopeCalibrator {
    fn default() -> Self {
        Self::new(
            SlopeParameters::LIBRE1_NON_FIXED,
            CalibrationSettings::default(),
        )
    }
}

impl Calibrator for Libre1NonFixedSlopeCalibrator {
    fn description(&self) -> &'static str {
        "Libre1NonFixedSlopeCalibrator"
    }

    fn raw_value_divider(&self) -> f64 {
        RAW_COUNT_DIVIDER
    }

    fn age_adjustment_needed(&self) -> bool {
        false
    }

    fn slope_parameters(&self) -> &SlopeParameters {
        &self.slope
    }

    fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }
}

/// Libre values that arrive already converted to glucose units, only
/// offset by finger sticks.
#[derive(Debug, Clone, PartialEq)]
pub struct LibreOopCalibrator {
    slope: SlopeParameters,
    settings: CalibrationSettings,
}

impl LibreOopCalibrator {
    /// Creates the calibrator.
    #[must_use]
    pub const fn new(slope: SlopeParameters, settings: CalibrationSettings) -> Self {
        Self { slope, settings }
    }
}

impl Default for LibreOopCalibrator {
    fn default() -> Self {
        Self::new(SlopeParameters::LIBRE_OOP, CalibrationSettings::default())
    }
}

impl Calibrator for LibreOopCalibrator {
    fn description(&self) -> &'static str {
        "LibreOopCalibrator"
    }

    fn raw_value_divider(&self) -> f64 {
        1.0
    }

    fn age_adjustment_needed(&self) -> bool {
        false
    }

    fn slope_parameters(&self) -> &SlopeParameters {
        &self.slope
    }

    fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }
}

/// Echoes raw values as glucose values and never calibrates.
#[derive(Debug, Clone, PartialEq)]
pub struct NoCalibrator {
    slope: SlopeParameters,
    settings: CalibrationSettings,
}

impl NoCalibrator {
    /// Creates the calibrator.
    #[must_use]
    pub const fn new(settings: CalibrationSettings) -> Self {
        Self {
            slope: SlopeParameters::fixed(1.0),
            settings,
        }
    }
}

impl Default for NoCalibrator {
    fn default() -> Self {
        Self::new(CalibrationSettings::default())
    }
}

impl Calibrator for NoCalibrator {
    fn description(&self) -> &'static str {
        "NoCalibrator"
    }

    fn raw_value_divider(&self) -> f64 {
        1.0
    }

    fn age_adjustment_needed(&self) -> bool {
        false
    }

    fn slope_parameters(&self) -> &SlopeParameters {
        &self.slope
    }

    fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    fn create_new_bg_reading(&self, input: ReadingInput<'_>) -> CalculatedReading {
        build_passthrough_reading(&input, &self.settings)
    }

    fn create_new_calibration(&self, _input: CalibrationInput<'_>) -> Option<CalibrationPoint> {
        None
    }

    fn initial_calibration(
        &self,
        _input: InitialCalibrationInput<'_>,
    ) -> Option<(CalibrationPoint, CalibrationPoint)> {
        None
    }
}

/// The configured calibrator, chosen at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibratorKind {
    /// Dexcom G5/G6.
    Dexcom(DexcomCalibrator),
    /// Libre 1 with fixed slope.
    Libre1(Libre1Calibrator),
    /// Libre 1 with bounded non-fixed slope.
    Libre1NonFixedSlope(Libre1NonFixedSlopeCalibrator),
    /// Libre with out-of-plausibility recalibration.
    LibreOop(LibreOopCalibrator),
    /// Raw pass-through.
    NoCalibration(NoCalibrator),
}

impl CalibratorKind {
    /// The wrapped calibrator.
    #[must_use]
    pub fn as_calibrator(&self) -> &dyn Calibrator {
        match self {
            Self::Dexcom(c) => c,
            Self::Libre1(c) => c,
            Self::Libre1NonFixedSlope(c) => c,
            Self::LibreOop(c) => c,
            Self::NoCalibration(c) => c,
        }
    }
}

impl Default for CalibratorKind {
    fn default() -> Self {
        Self::Dexcom(DexcomCalibrator::default())
    }
}

impl Calibrator for CalibratorKind {
    fn description(&self) -> &'static str {
        self.as_calibrator().description()
    }

    fn raw_value_divider(&self) -> f64 {
        self.as_calibrator().raw_value_divider()
    }

    fn age_adjustment_needed(&self) -> bool {
        self.as_calibrator().age_adjustment_needed()
    }

    fn slope_parameters(&self) -> &SlopeParameters {
        self.as_calibrator().slope_parameters()
    }

    fn settings(&self) -> &CalibrationSettings {
        self.as_calibrator().settings()
    }

    fn create_new_bg_reading(&self, input: ReadingInput<'_>) -> CalculatedReading {
        self.as_calibrator().create_new_bg_reading(input)
    }

    fn create_new_calibration(&self, input: CalibrationInput<'_>) -> Option<CalibrationPoint> {
        self.as_calibrator().create_new_calibration(input)
    }

    fn initial_calibration(
        &self,
        input: InitialCalibrationInput<'_>,
    ) -> Option<(CalibrationPoint, CalibrationPoint)> {
        self.as_calibrator().initial_calibration(input)
    }
}
