//! Transmitter time to wall-clock conversion.
//!
//! Dexcom transmitters stamp everything in seconds since their own
//! activation. A [`TransmitterTimeRx`] received at a known host instant pins
//! that activation to the wall clock.

use chrono::{DateTime, Duration, Utc};

use crate::wire::dexcom::TransmitterTimeRx;

/// Maps transmitter seconds onto wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitterClock {
    activation: DateTime<Utc>,
    session_start: Option<u32>,
}

impl TransmitterClock {
    /// Creates a clock from a known activation instant and optional session
    /// start in transmitter seconds.
    #[must_use]
    pub const fn new(activation: DateTime<Utc>, session_start: Option<u32>) -> Self {
        Self {
            activation,
            session_start,
        }
    }

    /// Pins the transmitter clock using a time response received at
    /// `received_at`.
    #[must_use]
    pub fn from_time_response(message: &TransmitterTimeRx, received_at: DateTime<Utc>) -> Self {
        Self {
            activation: received_at - Duration::seconds(i64::from(message.current_time)),
            session_start: message
                .has_session()
                .then_some(message.session_start_time),
        }
    }

    /// Wall-clock instant the transmitter was activated.
    #[must_use]
    pub const fn activation(&self) -> DateTime<Utc> {
        self.activation
    }

    /// Converts transmitter seconds to wall-clock time.
    #[must_use]
    pub fn to_wall_clock(&self, transmitter_seconds: u32) -> DateTime<Utc> {
        self.activation + Duration::seconds(i64::from(transmitter_seconds))
    }

    /// Wall-clock start of the running sensor session, if any.
    #[must_use]
    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session_start.map(|seconds| self.to_wall_clock(seconds))
    }

    /// Converts a wall-clock instant to transmitter seconds, as needed for
    /// session and calibration commands. `None` before activation or past
    /// the range of the transmitter clock.
    #[must_use]
    pub fn to_transmitter_seconds(&self, at: DateTime<Utc>) -> Option<u32> {
        u32::try_from((at - self.activation).num_seconds()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::dexcom::NO_SESSION;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_activation_from_time_response() {
        let message = TransmitterTimeRx {
            status: 0,
            current_time: 86_400,
            session_start_time: 3_600,
        };
        let clock = TransmitterClock::from_time_response(&message, received_at());
        assert_eq!(clock.activation(), received_at() - Duration::days(1));
        assert_eq!(
            clock.session_start(),
            Some(received_at() - Duration::hours(23))
        );
        assert_eq!(clock.to_wall_clock(86_400), received_at());
    }

    #[test]
    fn test_no_session() {
        let message = TransmitterTimeRx {
            status: 0,
            current_time: 10,
            session_start_time: NO_SESSION,
        };
        let clock = TransmitterClock::from_time_response(&message, received_at());
        assert_eq!(clock.session_start(), None);
    }

    #[test]
    fn test_to_transmitter_seconds() {
        let clock = TransmitterClock::new(received_at(), None);
        assert_eq!(
            clock.to_transmitter_seconds(received_at() + Duration::minutes(5)),
            Some(300)
        );
        assert_eq!(
            clock.to_transmitter_seconds(received_at() - Duration::seconds(1)),
            None
        );
    }
}
