//! Core configuration management.
//!
//! Everything the core would otherwise hardcode is supplied here:
//! - Physiological clamp bounds and sensor-error thresholds
//! - Early-sensor age adjustment constants
//! - Slope gap and calibration windows
//! - Kalman smoothing
//! - Per-variant slope parameter overrides
//! - Fragment reassembly staleness
//!
//! Configuration is read from a TOML file with `GLUCO__`-prefixed
//! environment variables layered on top (for example
//! `GLUCO__CALIBRATION__MAX_SLOPE_GAP_MINUTES=30`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::calibration::slope::SlopeParameters;
use crate::calibration::{
    CalibratorKind, DexcomCalibrator, Libre1Calibrator, Libre1NonFixedSlopeCalibrator,
    LibreOopCalibrator, NoCalibrator,
};
use crate::kalman::{SmoothingConfig, SmoothingModel};

static TRANSMITTER_ID: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[0-9A-Z]{6}$").ok());

/// Returns `true` if `id` looks like a Dexcom transmitter ID (six upper-case
/// letters or digits).
#[must_use]
pub fn is_valid_transmitter_id(id: &str) -> bool {
    TRANSMITTER_ID
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(id))
}

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file at the given path.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration fields are invalid", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Range a calculated value is forced into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysiologicalBounds {
    /// Values below this are treated as a sensor error.
    pub sensor_error_below: f64,
    /// Value reported for a sensor error.
    pub sensor_error_value: f64,
    /// Hypoglycemic floor.
    pub low: f64,
    /// Hyperglycemic ceiling.
    pub high: f64,
}

impl Default for PhysiologicalBounds {
    fn default() -> Self {
        Self {
            sensor_error_below: 10.0,
            sensor_error_value: 38.0,
            low: 39.0,
            high: 400.0,
        }
    }
}

/// Compensation for the low signal of a freshly inserted sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeAdjustment {
    /// Sensor age, in days, after which no adjustment applies.
    pub time_days: f64,
    /// Relative boost applied to a brand new sensor.
    pub factor: f64,
}

impl Default for AgeAdjustment {
    fn default() -> Self {
        Self {
            time_days: 1.9,
            factor: 0.45,
        }
    }
}

/// Slope parameter overrides per calibrator variant. Unset variants use
/// their built-in parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlopeOverrides {
    /// Dexcom G5/G6.
    pub dexcom: Option<SlopeParameters>,
    /// Libre 1 with fixed slope.
    pub libre1: Option<SlopeParameters>,
    /// Libre 1 with non-fixed slope.
    pub libre1_non_fixed_slope: Option<SlopeParameters>,
    /// Libre with out-of-plausibility recalibration.
    pub libre_oop: Option<SlopeParameters>,
}

/// Settings shared by every calibrator variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Clamp bounds for calculated values.
    pub bounds: PhysiologicalBounds,
    /// Early-sensor age adjustment.
    pub age_adjustment: AgeAdjustment,
    /// Readings further apart than this get a hidden slope.
    pub max_slope_gap_minutes: f64,
    /// Calibrations older than this, relative to a new one, are not fitted.
    pub calibration_window_days: f64,
    /// Number of recent readings recomputed after a new calibration.
    pub recalibration_window: usize,
    /// Kalman smoothing of adjusted raw values.
    pub smoothing: SmoothingConfig,
    /// Slope parameter overrides.
    pub slope_overrides: SlopeOverrides,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            bounds: PhysiologicalBounds::default(),
            age_adjustment: AgeAdjustment::default(),
            max_slope_gap_minutes: 21.0,
            calibration_window_days: 4.0,
            recalibration_window: 30,
            smoothing: SmoothingConfig::default(),
            slope_overrides: SlopeOverrides::default(),
        }
    }
}

impl CalibrationSettings {
    /// Age adjustment window as a duration.
    #[must_use]
    pub fn age_adjustment_time(&self) -> chrono::Duration {
        days_to_duration(self.age_adjustment.time_days)
    }

    /// Calibration fitting window as a duration.
    #[must_use]
    pub fn calibration_window(&self) -> chrono::Duration {
        days_to_duration(self.calibration_window_days)
    }

    // Negated comparisons also reject NaN.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn validate_into(&self, errors: &mut Vec<ConfigError>) {
        let b = &self.bounds;
        if !(b.low.is_finite() && b.high.is_finite()) || b.low < 0.0 || b.low >= b.high {
            errors.push(invalid(
                "calibration.bounds",
                format!("need 0 <= low < high, got low={} high={}", b.low, b.high),
            ));
        }
        if !(b.sensor_error_value.is_finite() && b.sensor_error_value >= 0.0) {
            errors.push(invalid(
                "calibration.bounds.sensor_error_value",
                "must be a non-negative number",
            ));
        }
        if !(self.age_adjustment.time_days > 0.0) {
            errors.push(invalid(
                "calibration.age_adjustment.time_days",
                "must be positive",
            ));
        }
        if !(self.age_adjustment.factor >= 0.0) {
            errors.push(invalid(
                "calibration.age_adjustment.factor",
                "must not be negative",
            ));
        }
        if !(self.max_slope_gap_minutes > 0.0) {
            errors.push(invalid(
                "calibration.max_slope_gap_minutes",
                "must be positive",
            ));
        }
        if !(self.calibration_window_days > 0.0) {
            errors.push(invalid(
                "calibration.calibration_window_days",
                "must be positive",
            ));
        }
        if self.recalibration_window == 0 {
            errors.push(invalid(
                "calibration.recalibration_window",
                "must be at least 1",
            ));
        }
        let s = &self.smoothing;
        if s.model != SmoothingModel::Off && !(s.process_noise > 0.0 && s.observation_noise > 0.0) {
            errors.push(invalid(
                "calibration.smoothing",
                "noise variances must be positive when smoothing is enabled",
            ));
        }
        let overrides = [
            ("dexcom", self.slope_overrides.dexcom),
            ("libre1", self.slope_overrides.libre1),
            ("libre1_non_fixed_slope", self.slope_overrides.libre1_non_fixed_slope),
            ("libre_oop", self.slope_overrides.libre_oop),
        ];
        for (name, params) in overrides {
            if let Some(Err(message)) = params.map(|p| p.validate()) {
                errors.push(invalid(
                    &format!("calibration.slope_overrides.{name}"),
                    message,
                ));
            }
        }
    }
}

/// Whole milliseconds in `days`, saturated to the range `chrono::Duration`
/// accepts. NaN maps to zero.
#[allow(clippy::cast_possible_truncation)]
fn days_to_duration(days: f64) -> chrono::Duration {
    let millis = ((days * 86_400_000.0).round() as i64).max(-i64::MAX);
    chrono::Duration::milliseconds(millis)
}

/// Fragment reassembly settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Inactivity after which a partial message is discarded.
    pub stale_after_ms: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 200,
        }
    }
}

impl ReassemblyConfig {
    /// Staleness window as a duration.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Calibration strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibratorVariant {
    /// Dexcom G5/G6 raw counts.
    #[default]
    Dexcom,
    /// Libre 1 with fixed slope.
    Libre1,
    /// Libre 1 with bounded non-fixed slope.
    Libre1NonFixedSlope,
    /// Values already calibrated by an out-of-plausibility algorithm.
    LibreOop,
    /// Raw values passed through untouched.
    NoCalibration,
}

/// The transmitter the host talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    /// Dexcom transmitter ID, if known.
    pub transmitter_id: Option<String>,
    /// Calibration strategy for its readings.
    pub calibrator: CalibratorVariant,
}

/// Complete core configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Calibration engine settings.
    pub calibration: CalibrationSettings,
    /// Packet reassembly settings.
    pub reassembly: ReassemblyConfig,
    /// Transmitter settings.
    pub transmitter: TransmitterConfig,
}

impl CoreConfig {
    /// Default configuration file location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when no home directory can be
    /// determined.
    pub fn default_path() -> ConfigResult<PathBuf> {
        directories::ProjectDirs::from("", "", "gluco")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| ConfigError::NotFound(PathBuf::from("config.toml")))
    }

    /// Loads from the default location, falling back to defaults when no
    /// file exists there.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed or fails
    /// validation.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Loads `path`, layers `GLUCO__` environment overrides on top and
    /// validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] for a missing file,
    /// [`ConfigError::ParseError`] for malformed content and a validation
    /// error for out-of-range values.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let merged = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("GLUCO")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let loaded: Self = merged
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        loaded.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(loaded)
    }

    /// Writes the configuration to `path` as TOML, creating parent
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a TOML string without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed content or invalid values.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let parsed: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks every field and reports all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the single validation error, or
    /// [`ConfigError::MultipleValidationErrors`] when several fields are
    /// invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        self.calibration.validate_into(&mut errors);
        if self.reassembly.stale_after_ms == 0 {
            errors.push(invalid("reassembly.stale_after_ms", "must be positive"));
        }
        if let Some(id) = &self.transmitter.transmitter_id {
            if !is_valid_transmitter_id(id) {
                errors.push(invalid(
                    "transmitter.transmitter_id",
                    format!("'{id}' is not six upper-case letters or digits"),
                ));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Builds the configured calibrator.
    #[must_use]
    pub fn calibrator(&self) -> CalibratorKind {
        let settings = self.calibration.clone();
        let overrides = settings.slope_overrides;
        match self.transmitter.calibrator {
            CalibratorVariant::Dexcom => CalibratorKind::Dexcom(DexcomCalibrator::new(
                overrides.dexcom.unwrap_or(SlopeParameters::DEXCOM),
                settings,
            )),
            CalibratorVariant::Libre1 => CalibratorKind::Libre1(Libre1Calibrator::new(
                overrides.libre1.unwrap_or(SlopeParameters::LIBRE1_FIXED),
                settings,
            )),
            CalibratorVariant::Libre1NonFixedSlope => {
                CalibratorKind::Libre1NonFixedSlope(Libre1NonFixedSlopeCalibrator::new(
                    overrides
                        .libre1_non_fixed_slope
                        .unwrap_or(SlopeParameters::LIBRE1_NON_FIXED),
                    settings,
                ))
            }
            CalibratorVariant::LibreOop => CalibratorKind::LibreOop(LibreOopCalibrator::new(
                overrides.libre_oop.unwrap_or(SlopeParameters::LIBRE_OOP),
                settings,
            )),
            CalibratorVariant::NoCalibration => {
                CalibratorKind::NoCalibration(NoCalibrator::new(settings))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibrator;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reassembly.stale_after(), Duration::from_millis(200));
        assert_eq!(
            config.calibration.age_adjustment_time(),
            chrono::Duration::milliseconds(164_160_000)
        );
    }

    #[test]
    fn test_transmitter_id_validation() {
        assert!(is_valid_transmitter_id("8G1234"));
        assert!(is_valid_transmitter_id("ABCDEF"));
        assert!(!is_valid_transmitter_id("8g1234"));
        assert!(!is_valid_transmitter_id("8G123"));
        assert!(!is_valid_transmitter_id("8G12345"));
        assert!(!is_valid_transmitter_id("8G-234"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = CoreConfig::default();
        config.calibration.bounds.low = 500.0;
        config.reassembly.stale_after_ms = 0;
        config.transmitter.transmitter_id = Some("bad".into());

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error() {
        let mut config = CoreConfig::default();
        config.calibration.recalibration_window = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "calibration.recalibration_window"
        ));
    }

    #[test]
    fn test_invalid_slope_override() {
        let mut config = CoreConfig::default();
        config.calibration.slope_overrides.dexcom = Some(SlopeParameters {
            low_slope_2: 2.0,
            ..SlopeParameters::DEXCOM
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CoreConfig::default();
        config.transmitter.transmitter_id = Some("8G1234".into());
        config.transmitter.calibrator = CalibratorVariant::Libre1NonFixedSlope;
        config.calibration.smoothing.model = SmoothingModel::LevelAndTrend;
        config.reassembly.stale_after_ms = 350;
        config.save_to(&path).unwrap();

        let loaded = CoreConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CoreConfig::from_toml(
            r#"
            [transmitter]
            calibrator = "libre_oop"

            [calibration.bounds]
            high = 350.0
            "#,
        )
        .unwrap();
        assert_eq!(config.transmitter.calibrator, CalibratorVariant::LibreOop);
        assert!((config.calibration.bounds.high - 350.0).abs() < f64::EPSILON);
        assert!((config.calibration.bounds.low - 39.0).abs() < f64::EPSILON);
        assert_eq!(config.reassembly, ReassemblyConfig::default());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            CoreConfig::from_toml("calibration = 3"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CoreConfig::load_from(&dir.path().join("absent.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_calibrator_selection() {
        let mut config = CoreConfig::default();
        assert_eq!(config.calibrator().description(), "DexcomCalibrator");

        config.transmitter.calibrator = CalibratorVariant::NoCalibration;
        assert_eq!(config.calibrator().description(), "NoCalibrator");

        config.transmitter.calibrator = CalibratorVariant::Libre1;
        config.calibration.slope_overrides.libre1 = Some(SlopeParameters {
            default_slope: 1.1,
            high_slope_1: 1.1,
            high_slope_2: 1.1,
            default_high_slope_high: 1.1,
            default_high_slope_low: 1.1,
            ..SlopeParameters::LIBRE1_FIXED
        });
        let calibrator = config.calibrator();
        assert!((calibrator.slope_parameters().default_slope - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unvalidated_windows_saturate() {
        let settings = CalibrationSettings {
            calibration_window_days: f64::NEG_INFINITY,
            ..CalibrationSettings::default()
        };
        assert_eq!(
            settings.calibration_window(),
            chrono::Duration::milliseconds(-i64::MAX)
        );

        let settings = CalibrationSettings {
            calibration_window_days: f64::INFINITY,
            ..CalibrationSettings::default()
        };
        assert_eq!(
            settings.calibration_window(),
            chrono::Duration::milliseconds(i64::MAX)
        );

        let mut settings = CalibrationSettings::default();
        settings.age_adjustment.time_days = f64::NAN;
        assert_eq!(settings.age_adjustment_time(), chrono::Duration::zero());
    }

    #[test]
    fn test_config_error_converts_to_core_error() {
        let err: crate::error::CoreError =
            invalid("reassembly.stale_after_ms", "must be positive").into();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("reassembly.stale_after_ms"));
    }
}
