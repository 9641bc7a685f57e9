//! Local curve fitting and slope finding over recent readings.
//!
//! Curves are quadratics in minutes relative to the newest reading. With
//! two earlier readings the curve passes through all three points, with one
//! it is the line through both, and with none it is flat.

use chrono::{DateTime, Utc};

use crate::types::{millis_between, CalculatedReading};

/// Coefficients of `a·m² + b·m + c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Curve {
    /// Quadratic coefficient.
    pub a: f64,
    /// Linear coefficient.
    pub b: f64,
    /// Constant coefficient.
    pub c: f64,
}

impl Curve {
    /// A flat curve through `value`.
    #[must_use]
    pub const fn constant(value: f64) -> Self {
        Self {
            a: 0.0,
            b: 0.0,
            c: value,
        }
    }

    /// Line through `(m1, y1)` and `(0, y0)`, or flat when `m1` is zero.
    #[must_use]
    pub fn line(y0: f64, m1: f64, y1: f64) -> Self {
        if m1 == 0.0 || !m1.is_finite() {
            return Self::constant(y0);
        }
        Self {
            a: 0.0,
            b: (y0 - y1) / -m1,
            c: y0,
        }
    }

    /// Lagrange quadratic through `(0, y0)`, `(m1, y1)` and `(m2, y2)`.
    /// Falls back to a line when two abscissae coincide.
    #[must_use]
    pub fn quadratic(y0: f64, m1: f64, y1: f64, m2: f64, y2: f64) -> Self {
        let d0 = (0.0 - m1) * (0.0 - m2);
        let d1 = (m1 - 0.0) * (m1 - m2);
        let d2 = (m2 - 0.0) * (m2 - m1);
        if d0 == 0.0 || d1 == 0.0 || d2 == 0.0 {
            return Self::line(y0, m1, y1);
        }
        let (p0, p1, p2) = (y0 / d0, y1 / d1, y2 / d2);
        Self {
            a: p0 + p1 + p2,
            b: -(p0 * (m1 + m2) + p1 * m2 + p2 * m1),
            c: p0 * m1 * m2,
        }
    }

    fn through(at: DateTime<Utc>, y0: f64, prior: &[(DateTime<Utc>, f64)]) -> Self {
        let minutes = |t: DateTime<Utc>| millis_between(at, t) / 60_000.0;
        match prior {
            [(t1, y1), (t2, y2), ..] => Self::quadratic(y0, minutes(*t1), *y1, minutes(*t2), *y2),
            [(t1, y1)] => Self::line(y0, minutes(*t1), *y1),
            [] => Self::constant(y0),
        }
    }
}

/// Refits the calculated value curve of `reading` through its two newest
/// predecessors in `prior` (newest first).
pub fn find_new_curve(reading: &mut CalculatedReading, prior: &[CalculatedReading]) {
    let points: Vec<_> = prior
        .iter()
        .take(2)
        .map(|r| (r.timestamp, r.calculated_value))
        .collect();
    let curve = Curve::through(reading.timestamp, reading.calculated_value, &points);
    reading.a = curve.a;
    reading.b = curve.b;
    reading.c = curve.c;
}

/// Refits the adjusted raw curve of `reading` through its two newest
/// predecessors in `prior` (newest first).
pub fn find_new_raw_curve(reading: &mut CalculatedReading, prior: &[CalculatedReading]) {
    let points: Vec<_> = prior
        .iter()
        .take(2)
        .map(|r| (r.timestamp, r.age_adjusted_raw_value))
        .collect();
    let curve = Curve::through(reading.timestamp, reading.age_adjusted_raw_value, &points);
    reading.ra = curve.a;
    reading.rb = curve.b;
    reading.rc = curve.c;
}

/// Sets the per-minute slope of `reading` against the newest reading in
/// `prior` and returns whether the slope should be hidden.
///
/// The slope is hidden with fewer than two earlier readings, when the gap
/// exceeds `max_gap_minutes`, and when the timestamps coincide or run
/// backwards.
pub fn find_slope(
    reading: &mut CalculatedReading,
    prior: &[CalculatedReading],
    max_gap_minutes: f64,
) -> bool {
    reading.calculated_value_slope = 0.0;
    if prior.len() < 2 {
        return true;
    }
    let newest = &prior[0];
    let gap_minutes = newest.minutes_until(reading.timestamp);
    if gap_minutes <= 0.0 {
        return true;
    }
    reading.calculated_value_slope =
        (reading.calculated_value - newest.calculated_value) / gap_minutes;
    gap_minutes > max_gap_minutes
}
