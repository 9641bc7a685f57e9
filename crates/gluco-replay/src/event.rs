//! Replay capture format.
//!
//! One JSON object per line, tagged by `kind`:
//!
//! ```text
//! {"kind":"sensor_start","at":"2024-03-01T08:00:00Z"}
//! {"kind":"packet","at":"2024-03-01T08:05:00Z","hex":"2f00..."}
//! {"kind":"fragment","at":"2024-03-01T08:05:01Z","hex":"0a0102..."}
//! {"kind":"calibration","at":"2024-03-01T08:06:00Z","bg":120.0}
//! ```
//!
//! A calibration with `second_bg` starts an uncalibrated sensor from two
//! finger sticks.

use anyhow::Context;
use chrono::{DateTime, Utc};
use gluco_core::{CalculatedReading, CalibrationPoint};
use serde::{Deserialize, Serialize};

/// One captured event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayEvent {
    /// A complete BLE notification.
    Packet {
        /// Receive time.
        at: DateTime<Utc>,
        /// Notification bytes as hex.
        hex: String,
    },
    /// One fragment of a chunked text message.
    Fragment {
        /// Receive time.
        at: DateTime<Utc>,
        /// Fragment bytes, header included, as hex.
        hex: String,
    },
    /// A finger-stick value entered by the user.
    Calibration {
        /// When the finger stick was taken.
        at: DateTime<Utc>,
        /// Blood glucose.
        bg: f64,
        /// Second finger stick for an initial calibration.
        #[serde(default)]
        second_bg: Option<f64>,
    },
    /// A new sensor was inserted.
    SensorStart {
        /// Insertion time.
        at: DateTime<Utc>,
    },
}

impl ReplayEvent {
    /// Parses one capture line.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or an unknown `kind`.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        serde_json::from_str(line).context("Malformed replay event")
    }

    /// When the event happened.
    pub const fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Packet { at, .. }
            | Self::Fragment { at, .. }
            | Self::Calibration { at, .. }
            | Self::SensorStart { at } => *at,
        }
    }
}

/// Decodes a hex payload.
///
/// # Errors
///
/// Returns an error if `hex` is not valid hexadecimal.
pub fn decode_hex(hex: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(hex.trim()).with_context(|| format!("Invalid hex payload '{hex}'"))
}

/// One line of replay output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayRecord {
    /// A reading computed from a sensor data packet.
    Reading(CalculatedReading),
    /// A calibration created from a finger stick.
    Calibration(CalibrationPoint),
    /// A reassembled text message.
    Message {
        /// Opcode of the fragments.
        opcode: u8,
        /// Reassembled text.
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_each_kind() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(
            ReplayEvent::parse(r#"{"kind":"sensor_start","at":"2024-03-01T08:00:00Z"}"#).unwrap(),
            ReplayEvent::SensorStart { at }
        );
        assert_eq!(
            ReplayEvent::parse(r#"{"kind":"packet","at":"2024-03-01T08:00:00Z","hex":"2f00"}"#)
                .unwrap(),
            ReplayEvent::Packet {
                at,
                hex: "2f00".into()
            }
        );
        assert_eq!(
            ReplayEvent::parse(r#"{"kind":"calibration","at":"2024-03-01T08:00:00Z","bg":120.5}"#)
                .unwrap(),
            ReplayEvent::Calibration {
                at,
                bg: 120.5,
                second_bg: None
            }
        );
        let fragment =
            ReplayEvent::parse(r#"{"kind":"fragment","at":"2024-03-01T08:00:00Z","hex":"0a0101"}"#)
                .unwrap();
        assert_eq!(fragment.at(), at);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        assert!(ReplayEvent::parse(r#"{"kind":"reboot","at":"2024-03-01T08:00:00Z"}"#).is_err());
        assert!(ReplayEvent::parse("not json").is_err());
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("2f0A ").unwrap(), vec![0x2F, 0x0A]);
        assert!(decode_hex("2g").is_err());
    }

    #[test]
    fn test_record_is_tagged() {
        let record = ReplayRecord::Message {
            opcode: 10,
            text: "ok".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"kind":"message","opcode":10,"text":"ok"}"#);
    }
}
