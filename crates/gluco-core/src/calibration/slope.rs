//! Slope bounds per sensor family.

use serde::{Deserialize, Serialize};

/// Thresholds that bound how far a fitted slope may stray.
///
/// `[low_slope_2, high_slope_2]` are hard bounds: a slope outside them is
/// replaced by `default_slope`. `[low_slope_1, high_slope_1]` are soft
/// bounds checked while few calibrations exist; their replacements come
/// from the `default_*_slope_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlopeParameters {
    /// Soft lower bound.
    pub low_slope_1: f64,
    /// Hard lower bound.
    pub low_slope_2: f64,
    /// Soft upper bound.
    pub high_slope_1: f64,
    /// Hard upper bound.
    pub high_slope_2: f64,
    /// Floor for a low slope once three or more calibrations exist.
    pub default_low_slope_low: f64,
    /// Floor for a low slope with exactly two calibrations.
    pub default_low_slope_high: f64,
    /// Neutral slope.
    pub default_slope: f64,
    /// Replacement for a high slope once three or more calibrations exist.
    pub default_high_slope_high: f64,
    /// Replacement for a high slope with exactly two calibrations.
    pub default_high_slope_low: f64,
}

impl SlopeParameters {
    /// Dexcom G5/G6.
    pub const DEXCOM: Self = Self {
        low_slope_1: 0.75,
        low_slope_2: 0.70,
        high_slope_1: 1.3,
        high_slope_2: 1.4,
        default_low_slope_low: 0.75,
        default_low_slope_high: 0.70,
        default_slope: 1.0,
        default_high_slope_high: 1.3,
        default_high_slope_low: 1.2,
    };

    /// Libre 1 with the slope pinned to 1.
    pub const LIBRE1_FIXED: Self = Self::fixed(1.0);

    /// Libre 1 with a bounded fitted slope.
    pub const LIBRE1_NON_FIXED: Self = Self {
        low_slope_1: 0.55,
        low_slope_2: 0.50,
        high_slope_1: 1.5,
        high_slope_2: 1.6,
        default_low_slope_low: 0.55,
        default_low_slope_high: 0.50,
        default_slope: 1.0,
        default_high_slope_high: 1.5,
        default_high_slope_low: 1.4,
    };

    /// Libre values already calibrated by an out-of-plausibility algorithm.
    pub const LIBRE_OOP: Self = Self::fixed(1.0);

    /// Parameters that force every slope to `slope`.
    #[must_use]
    pub const fn fixed(slope: f64) -> Self {
        Self {
            low_slope_1: slope,
            low_slope_2: slope,
            high_slope_1: slope,
            high_slope_2: slope,
            default_low_slope_low: slope,
            default_low_slope_high: slope,
            default_slope: slope,
            default_high_slope_high: slope,
            default_high_slope_low: slope,
        }
    }

    /// Checks that the bounds are ordered and every value is a positive
    /// finite number.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        let all = [
            self.low_slope_1,
            self.low_slope_2,
            self.high_slope_1,
            self.high_slope_2,
            self.default_low_slope_low,
            self.default_low_slope_high,
            self.default_slope,
            self.default_high_slope_high,
            self.default_high_slope_low,
        ];
        if all.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err("all slope parameters must be positive finite numbers".to_string());
        }
        let ordered = self.low_slope_2 <= self.low_slope_1
            && self.low_slope_1 <= self.default_slope
            && self.default_slope <= self.high_slope_1
            && self.high_slope_1 <= self.high_slope_2;
        if !ordered {
            return Err(format!(
                "need low_slope_2 <= low_slope_1 <= default_slope <= high_slope_1 <= high_slope_2, got {} {} {} {} {}",
                self.low_slope_2,
                self.low_slope_1,
                self.default_slope,
                self.high_slope_1,
                self.high_slope_2
            ));
        }
        Ok(())
    }

    /// Returns `true` if `slope` lies within the hard bounds.
    #[must_use]
    pub fn within_hard_bounds(&self, slope: f64) -> bool {
        (self.low_slope_2..=self.high_slope_2).contains(&slope)
    }

    /// Returns `true` if `slope` lies within the soft bounds.
    #[must_use]
    pub fn within_soft_bounds(&self, slope: f64) -> bool {
        (self.low_slope_1..=self.high_slope_1).contains(&slope)
    }
}
