//! Dexcom G5/G6 transmitter messages.
//!
//! Multi-byte fields and the trailing CRC are little-endian. Timestamps are
//! seconds since transmitter activation (see [`crate::clock`]).
//!
//! # Sensor data response layout (16 bytes, 14 in the short form)
//!
//! ```text
//! [0]      : opcode 0x2F
//! [1]      : status
//! [2-5]    : timestamp (u32, transmitter seconds)
//! [6-9]    : unfiltered raw count (u32)
//! [10-13]  : filtered raw count (u32), [10-11] reserved in the short form
//! [14-15]  : CRC-CCITT/XModem, [12-13] in the short form
//! ```

use super::{ByteOrder, DecodeError, FieldReader, TransmitterMessage};
use tracing::trace;

const ORDER: ByteOrder = ByteOrder::Little;

/// Session start/stop value meaning "no session".
pub const NO_SESSION: u32 = 0xFFFF_FFFF;

/// Dexcom G5/G6 opcodes. `Tx` opcodes travel host to transmitter, `Rx`
/// opcodes transmitter to host.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    AuthRequestTx = 0x01,
    AuthRequest2Tx = 0x02,
    AuthRequestRx = 0x03,
    AuthChallengeTx = 0x04,
    AuthChallengeRx = 0x05,
    KeepAlive = 0x06,
    BondRequest = 0x07,
    PairRequestRx = 0x08,
    DisconnectTx = 0x09,
    BatteryStatusTx = 0x22,
    BatteryStatusRx = 0x23,
    TransmitterTimeTx = 0x24,
    TransmitterTimeRx = 0x25,
    SessionStartTx = 0x26,
    SessionStartRx = 0x27,
    SessionStopTx = 0x28,
    SessionStopRx = 0x29,
    SensorDataTx = 0x2E,
    SensorDataRx = 0x2F,
    GlucoseTx = 0x30,
    GlucoseRx = 0x31,
    CalibrateGlucoseTx = 0x34,
    CalibrateGlucoseRx = 0x35,
    ResetTx = 0x42,
    ResetRx = 0x43,
    TransmitterVersionTx = 0x4A,
    TransmitterVersionRx = 0x4B,
    GlucoseG6Tx = 0x4E,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::AuthRequestTx,
            0x02 => Self::AuthRequest2Tx,
            0x03 => Self::AuthRequestRx,
            0x04 => Self::AuthChallengeTx,
            0x05 => Self::AuthChallengeRx,
            0x06 => Self::KeepAlive,
            0x07 => Self::BondRequest,
            0x08 => Self::PairRequestRx,
            0x09 => Self::DisconnectTx,
            0x22 => Self::BatteryStatusTx,
            0x23 => Self::BatteryStatusRx,
            0x24 => Self::TransmitterTimeTx,
            0x25 => Self::TransmitterTimeRx,
            0x26 => Self::SessionStartTx,
            0x27 => Self::SessionStartRx,
            0x28 => Self::SessionStopTx,
            0x29 => Self::SessionStopRx,
            0x2E => Self::SensorDataTx,
            0x2F => Self::SensorDataRx,
            0x30 => Self::GlucoseTx,
            0x31 => Self::GlucoseRx,
            0x34 => Self::CalibrateGlucoseTx,
            0x35 => Self::CalibrateGlucoseRx,
            0x42 => Self::ResetTx,
            0x43 => Self::ResetRx,
            0x4A => Self::TransmitterVersionTx,
            0x4B => Self::TransmitterVersionRx,
            0x4E => Self::GlucoseG6Tx,
            other => return Err(other),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode as Self
    }
}

// ============================================================================
// Transmitter -> host
// ============================================================================

/// Response to an authentication request: hash of the token and a new challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequestRx {
    /// Hash of the token sent in the request.
    pub token_hash: [u8; 8],
    /// Challenge the host must answer.
    pub challenge: [u8; 8],
}

impl TransmitterMessage for AuthRequestRx {
    const OPCODE: u8 = Opcode::AuthRequestRx as u8;
    const MIN_LEN: usize = 17;
    const HAS_CRC: bool = false;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            token_hash: reader.array(1)?,
            challenge: reader.array(9)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.token_hash);
        out.extend_from_slice(&self.challenge);
    }
}

/// Outcome of the authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthChallengeRx {
    /// Whether the host answered the challenge correctly.
    pub authenticated: bool,
    /// Whether the transmitter already holds a bond with the host.
    pub bonded: bool,
}

impl TransmitterMessage for AuthChallengeRx {
    const OPCODE: u8 = Opcode::AuthChallengeRx as u8;
    const MIN_LEN: usize = 3;
    const HAS_CRC: bool = false;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            authenticated: reader.u8(1)? == 0x01,
            // 0x02 means "not bonded"; any other value is a bonded transmitter.
            bonded: reader.u8(2)? != 0x02,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.authenticated));
        out.push(if self.bonded { 0x01 } else { 0x02 });
    }
}

/// Pairing confirmation after a bond request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairRequestRx {
    /// Whether pairing succeeded.
    pub paired: bool,
}

impl TransmitterMessage for PairRequestRx {
    const OPCODE: u8 = Opcode::PairRequestRx as u8;
    const MIN_LEN: usize = 2;
    const HAS_CRC: bool = false;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            paired: reader.u8(1)? == 0x01,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.paired));
    }
}

/// Transmitter clock and session start, both in transmitter seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitterTimeRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Seconds since transmitter activation.
    pub current_time: u32,
    /// Session start in transmitter seconds, [`NO_SESSION`] if none.
    pub session_start_time: u32,
}

impl TransmitterTimeRx {
    /// Returns `true` if the transmitter reports a running sensor session.
    #[must_use]
    pub const fn has_session(&self) -> bool {
        self.session_start_time != NO_SESSION
    }
}

impl TransmitterMessage for TransmitterTimeRx {
    const OPCODE: u8 = Opcode::TransmitterTimeRx as u8;
    const MIN_LEN: usize = 16;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u8(1)?,
            current_time: reader.u32(2)?,
            session_start_time: reader.u32(6)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        ORDER.put_u32(out, self.current_time);
        ORDER.put_u32(out, self.session_start_time);
        out.extend_from_slice(&[0; 4]);
    }
}

/// Battery telemetry. G5 transmitters report 12 bytes including a
/// resistance field; G6 transmitters report 10 bytes without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatusRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Battery voltage under no load.
    pub voltage_a: u16,
    /// Battery voltage under load.
    pub voltage_b: u16,
    /// Battery resistance, reported by G5 transmitters only.
    pub resistance: Option<u16>,
    /// Days since the transmitter was first activated.
    pub runtime_days: u8,
    /// Transmitter temperature in degrees Celsius.
    pub temperature: u8,
}

impl BatteryStatusRx {
    const G5_LEN: usize = 12;
}

impl TransmitterMessage for BatteryStatusRx {
    const OPCODE: u8 = Opcode::BatteryStatusRx as u8;
    const MIN_LEN: usize = 10;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        match reader.len() {
            Self::MIN_LEN => Ok(Self {
                status: reader.u8(1)?,
                voltage_a: reader.u16(2)?,
                voltage_b: reader.u16(4)?,
                resistance: None,
                runtime_days: reader.u8(6)?,
                temperature: reader.u8(7)?,
            }),
            len if len >= Self::G5_LEN => Ok(Self {
                status: reader.u8(1)?,
                voltage_a: reader.u16(2)?,
                voltage_b: reader.u16(4)?,
                resistance: Some(reader.u16(6)?),
                runtime_days: reader.u8(8)?,
                temperature: reader.u8(9)?,
            }),
            len => Err(DecodeError::TooShort {
                expected: Self::G5_LEN,
                actual: len,
            }),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        ORDER.put_u16(out, self.voltage_a);
        ORDER.put_u16(out, self.voltage_b);
        if let Some(resistance) = self.resistance {
            ORDER.put_u16(out, resistance);
        }
        out.push(self.runtime_days);
        out.push(self.temperature);
    }
}

/// Raw sensor counts at a transmitter timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDataRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Transmitter seconds at which the value was measured.
    pub timestamp: u32,
    /// Unfiltered raw count.
    pub unfiltered: u32,
    /// Filtered raw count, absent from the short form.
    pub filtered: Option<u32>,
}

impl SensorDataRx {
    /// Length of the form that carries a filtered count.
    pub const FULL_LEN: usize = 16;
}

impl TransmitterMessage for SensorDataRx {
    const OPCODE: u8 = Opcode::SensorDataRx as u8;
    const MIN_LEN: usize = 14;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u8(1)?,
            timestamp: reader.u32(2)?,
            unfiltered: reader.u32(6)?,
            filtered: if reader.len() >= Self::FULL_LEN {
                Some(reader.u32(10)?)
            } else {
                None
            },
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        ORDER.put_u32(out, self.timestamp);
        ORDER.put_u32(out, self.unfiltered);
        // The short form keeps its two reserved bytes.
        match self.filtered {
            Some(filtered) => ORDER.put_u32(out, filtered),
            None => ORDER.put_u16(out, 0),
        }
    }
}

/// Glucose value computed by the transmitter's own algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlucoseRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Reading sequence number.
    pub sequence: u32,
    /// Transmitter seconds at which the value was measured.
    pub timestamp: u32,
    /// 12-bit glucose value in mg/dL.
    pub glucose: u16,
    /// Value is meant for display and not for treatment decisions.
    pub display_only: bool,
    /// Transmitter algorithm state.
    pub state: u8,
    /// Rate of change reported by the transmitter.
    pub trend: i8,
}

impl GlucoseRx {
    const VALUE_MASK: u16 = 0x0FFF;
    const DISPLAY_ONLY_MASK: u16 = 0xF000;
}

impl TransmitterMessage for GlucoseRx {
    const OPCODE: u8 = Opcode::GlucoseRx as u8;
    const MIN_LEN: usize = 16;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        let glucose_bytes = reader.u16(10)?;
        Ok(Self {
            status: reader.u8(1)?,
            sequence: reader.u32(2)?,
            timestamp: reader.u32(6)?,
            glucose: glucose_bytes & Self::VALUE_MASK,
            display_only: glucose_bytes & Self::DISPLAY_ONLY_MASK != 0,
            state: reader.u8(12)?,
            trend: reader.i8(13)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        ORDER.put_u32(out, self.sequence);
        ORDER.put_u32(out, self.timestamp);
        let flag = if self.display_only { 0x1000 } else { 0 };
        ORDER.put_u16(out, (self.glucose & Self::VALUE_MASK) | flag);
        out.push(self.state);
        out.extend_from_slice(&self.trend.to_le_bytes());
    }
}

/// Firmware and hardware identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitterVersionRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Main firmware version bytes.
    pub firmware: [u8; 4],
    /// Bluetooth stack firmware version bytes.
    pub bt_firmware: [u8; 4],
    /// Hardware revision.
    pub hardware_rev: u8,
    /// Remaining firmware identification bytes.
    pub other_firmware: [u8; 6],
}

impl TransmitterVersionRx {
    /// Firmware version in dotted form, e.g. `1.6.5.25`.
    #[must_use]
    pub fn firmware_version(&self) -> String {
        self.firmware
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl TransmitterMessage for TransmitterVersionRx {
    const OPCODE: u8 = Opcode::TransmitterVersionRx as u8;
    const MIN_LEN: usize = 19;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u8(1)?,
            firmware: reader.array(2)?,
            bt_firmware: reader.array(6)?,
            hardware_rev: reader.u8(10)?,
            other_firmware: reader.array(11)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        out.extend_from_slice(&self.firmware);
        out.extend_from_slice(&self.bt_firmware);
        out.push(self.hardware_rev);
        out.extend_from_slice(&self.other_firmware);
    }
}

/// Acknowledgement of a session start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStartRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Whether the request was accepted.
    pub received: u8,
    /// Start time the host asked for.
    pub requested_start_time: u32,
    /// Session start in transmitter seconds, [`NO_SESSION`] if none.
    pub session_start_time: u32,
    /// Transmitter clock when the response was sent.
    pub transmitter_time: u32,
}

impl TransmitterMessage for SessionStartRx {
    const OPCODE: u8 = Opcode::SessionStartRx as u8;
    const MIN_LEN: usize = 17;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u8(1)?,
            received: reader.u8(2)?,
            requested_start_time: reader.u32(3)?,
            session_start_time: reader.u32(7)?,
            transmitter_time: reader.u32(11)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        out.push(self.received);
        ORDER.put_u32(out, self.requested_start_time);
        ORDER.put_u32(out, self.session_start_time);
        ORDER.put_u32(out, self.transmitter_time);
    }
}

/// Acknowledgement of a session stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStopRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Whether the request was accepted.
    pub received: u8,
    /// Stop time in transmitter seconds.
    pub session_stop_time: u32,
    /// Session start in transmitter seconds, [`NO_SESSION`] if none.
    pub session_start_time: u32,
    /// Transmitter clock when the response was sent.
    pub transmitter_time: u32,
}

impl TransmitterMessage for SessionStopRx {
    const OPCODE: u8 = Opcode::SessionStopRx as u8;
    const MIN_LEN: usize = 17;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u8(1)?,
            received: reader.u8(2)?,
            session_stop_time: reader.u32(3)?,
            session_start_time: reader.u32(7)?,
            transmitter_time: reader.u32(11)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        out.push(self.received);
        ORDER.put_u32(out, self.session_stop_time);
        ORDER.put_u32(out, self.session_start_time);
        ORDER.put_u32(out, self.transmitter_time);
    }
}

/// Acknowledgement of a calibration sent to the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrateGlucoseRx {
    /// Transmitter status byte.
    pub status: u8,
    /// Kind of calibration the transmitter applied.
    pub calibration_type: u8,
}

impl TransmitterMessage for CalibrateGlucoseRx {
    const OPCODE: u8 = Opcode::CalibrateGlucoseRx as u8;
    const MIN_LEN: usize = 5;
    const HAS_CRC: bool = true;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: reader.u8(1)?,
            calibration_type: reader.u8(2)?,
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        out.push(self.calibration_type);
    }
}

/// Any message a G5/G6 transmitter sends to the host.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMessage {
    AuthRequest(AuthRequestRx),
    AuthChallenge(AuthChallengeRx),
    PairRequest(PairRequestRx),
    TransmitterTime(TransmitterTimeRx),
    BatteryStatus(BatteryStatusRx),
    SensorData(SensorDataRx),
    Glucose(GlucoseRx),
    TransmitterVersion(TransmitterVersionRx),
    SessionStart(SessionStartRx),
    SessionStop(SessionStopRx),
    CalibrateGlucose(CalibrateGlucoseRx),
}

impl RxMessage {
    /// Routes `bytes` to the decoder selected by its first byte.
    ///
    /// Returns `None` for unknown opcodes, host-to-transmitter opcodes and
    /// any buffer the selected decoder rejects.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let first = *bytes.first()?;
        let Ok(opcode) = Opcode::try_from(first) else {
            trace!(opcode = first, "Dropping packet with unknown opcode");
            return None;
        };
        match opcode {
            Opcode::AuthRequestRx => AuthRequestRx::decode(bytes).map(Self::AuthRequest),
            Opcode::AuthChallengeRx => AuthChallengeRx::decode(bytes).map(Self::AuthChallenge),
            Opcode::PairRequestRx => PairRequestRx::decode(bytes).map(Self::PairRequest),
            Opcode::TransmitterTimeRx => {
                TransmitterTimeRx::decode(bytes).map(Self::TransmitterTime)
            }
            Opcode::BatteryStatusRx => BatteryStatusRx::decode(bytes).map(Self::BatteryStatus),
            Opcode::SensorDataRx => SensorDataRx::decode(bytes).map(Self::SensorData),
            Opcode::GlucoseRx => GlucoseRx::decode(bytes).map(Self::Glucose),
            Opcode::TransmitterVersionRx => {
                TransmitterVersionRx::decode(bytes).map(Self::TransmitterVersion)
            }
            Opcode::SessionStartRx => SessionStartRx::decode(bytes).map(Self::SessionStart),
            Opcode::SessionStopRx => SessionStopRx::decode(bytes).map(Self::SessionStop),
            Opcode::CalibrateGlucoseRx => {
                CalibrateGlucoseRx::decode(bytes).map(Self::CalibrateGlucose)
            }
            other => {
                trace!(?other, "Dropping host-to-transmitter opcode on receive path");
                None
            }
        }
    }

    /// Opcode of the wrapped message.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::AuthRequest(_) => Opcode::AuthRequestRx,
            Self::AuthChallenge(_) => Opcode::AuthChallengeRx,
            Self::PairRequest(_) => Opcode::PairRequestRx,
            Self::TransmitterTime(_) => Opcode::TransmitterTimeRx,
            Self::BatteryStatus(_) => Opcode::BatteryStatusRx,
            Self::SensorData(_) => Opcode::SensorDataRx,
            Self::Glucose(_) => Opcode::GlucoseRx,
            Self::TransmitterVersion(_) => Opcode::TransmitterVersionRx,
            Self::SessionStart(_) => Opcode::SessionStartRx,
            Self::SessionStop(_) => Opcode::SessionStopRx,
            Self::CalibrateGlucose(_) => Opcode::CalibrateGlucoseRx,
        }
    }

    /// Serializes the wrapped message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::AuthRequest(m) => m.encode(),
            Self::AuthChallenge(m) => m.encode(),
            Self::PairRequest(m) => m.encode(),
            Self::TransmitterTime(m) => m.encode(),
            Self::BatteryStatus(m) => m.encode(),
            Self::SensorData(m) => m.encode(),
            Self::Glucose(m) => m.encode(),
            Self::TransmitterVersion(m) => m.encode(),
            Self::SessionStart(m) => m.encode(),
            Self::SessionStop(m) => m.encode(),
            Self::CalibrateGlucose(m) => m.encode(),
        }
    }
}

// ============================================================================
// Host -> transmitter
// ============================================================================

/// Commands the host sends to a G5/G6 transmitter.
///
/// Authentication hashes are produced outside the core; the codec only
/// frames the opaque bytes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMessage {
    /// Start authentication with a single-use token. G6 transmitters use
    /// the second-generation request opcode.
    AuthRequest { token: [u8; 8], g6: bool },
    /// Answer to the transmitter's challenge.
    AuthChallenge { hash: [u8; 8] },
    /// Keep the connection open for `seconds`.
    KeepAlive { seconds: u8 },
    BondRequest,
    Disconnect,
    TransmitterTime,
    BatteryStatus,
    SensorData,
    Glucose,
    /// Glucose request understood by G6 firmware.
    GlucoseG6,
    TransmitterVersion,
    Reset,
    /// Start a sensor session at `start_time` transmitter seconds.
    SessionStart { start_time: u32, seconds_since_epoch: u32 },
    SessionStop { stop_time: u32 },
    /// Send a finger-stick value in mg/dL measured at transmitter `time`.
    CalibrateGlucose { glucose: u16, time: u32 },
}

impl TxMessage {
    const AUTH_END_BYTE: u8 = 0x02;

    /// Opcode of the command.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::AuthRequest { g6: false, .. } => Opcode::AuthRequestTx,
            Self::AuthRequest { g6: true, .. } => Opcode::AuthRequest2Tx,
            Self::AuthChallenge { .. } => Opcode::AuthChallengeTx,
            Self::KeepAlive { .. } => Opcode::KeepAlive,
            Self::BondRequest => Opcode::BondRequest,
            Self::Disconnect => Opcode::DisconnectTx,
            Self::TransmitterTime => Opcode::TransmitterTimeTx,
            Self::BatteryStatus => Opcode::BatteryStatusTx,
            Self::SensorData => Opcode::SensorDataTx,
            Self::Glucose => Opcode::GlucoseTx,
            Self::GlucoseG6 => Opcode::GlucoseG6Tx,
            Self::TransmitterVersion => Opcode::TransmitterVersionTx,
            Self::Reset => Opcode::ResetTx,
            Self::SessionStart { .. } => Opcode::SessionStartTx,
            Self::SessionStop { .. } => Opcode::SessionStopTx,
            Self::CalibrateGlucose { .. } => Opcode::CalibrateGlucoseTx,
        }
    }

    const fn has_crc(&self) -> bool {
        !matches!(
            self,
            Self::AuthRequest { .. }
                | Self::AuthChallenge { .. }
                | Self::KeepAlive { .. }
                | Self::BondRequest
                | Self::Disconnect
        )
    }

    /// Serializes the command: opcode, fields, then CRC when required.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![u8::from(self.opcode())];
        match *self {
            Self::AuthRequest { token, .. } => {
                out.extend_from_slice(&token);
                out.push(Self::AUTH_END_BYTE);
            }
            Self::AuthChallenge { hash } => out.extend_from_slice(&hash),
            Self::KeepAlive { seconds } => out.push(seconds),
            Self::SessionStart {
                start_time,
                seconds_since_epoch,
            } => {
                ORDER.put_u32(&mut out, start_time);
                ORDER.put_u32(&mut out, seconds_since_epoch);
            }
            Self::SessionStop { stop_time } => ORDER.put_u32(&mut out, stop_time),
            Self::CalibrateGlucose { glucose, time } => {
                ORDER.put_u16(&mut out, glucose);
                ORDER.put_u32(&mut out, time);
            }
            Self::BondRequest
            | Self::Disconnect
            | Self::TransmitterTime
            | Self::BatteryStatus
            | Self::SensorData
            | Self::Glucose
            | Self::GlucoseG6
            | Self::TransmitterVersion
            | Self::Reset => {}
        }
        if self.has_crc() {
            super::crc::append_crc(&mut out, ORDER);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<RxMessage> {
        vec![
            RxMessage::AuthRequest(AuthRequestRx {
                token_hash: [1, 2, 3, 4, 5, 6, 7, 8],
                challenge: [8, 7, 6, 5, 4, 3, 2, 1],
            }),
            RxMessage::AuthChallenge(AuthChallengeRx {
                authenticated: true,
                bonded: false,
            }),
            RxMessage::PairRequest(PairRequestRx { paired: true }),
            RxMessage::TransmitterTime(TransmitterTimeRx {
                status: 0,
                current_time: 864_000,
                session_start_time: 700_000,
            }),
            RxMessage::BatteryStatus(BatteryStatusRx {
                status: 0,
                voltage_a: 3_100,
                voltage_b: 2_900,
                resistance: Some(1_200),
                runtime_days: 42,
                temperature: 30,
            }),
            RxMessage::BatteryStatus(BatteryStatusRx {
                status: 0,
                voltage_a: 3_000,
                voltage_b: 2_850,
                resistance: None,
                runtime_days: 7,
                temperature: 28,
            }),
            RxMessage::SensorData(SensorDataRx {
                status: 0,
                timestamp: 864_300,
                unfiltered: 152_384,
                filtered: Some(150_112),
            }),
            RxMessage::SensorData(SensorDataRx {
                status: 0x81,
                timestamp: 864_600,
                unfiltered: 149_760,
                filtered: None,
            }),
            RxMessage::Glucose(GlucoseRx {
                status: 0,
                sequence: 1_234,
                timestamp: 864_300,
                glucose: 112,
                display_only: true,
                state: 6,
                trend: -3,
            }),
            RxMessage::TransmitterVersion(TransmitterVersionRx {
                status: 0,
                firmware: [1, 6, 5, 25],
                bt_firmware: [1, 0, 4, 7],
                hardware_rev: 255,
                other_firmware: [1, 2, 3, 4, 5, 6],
            }),
            RxMessage::SessionStart(SessionStartRx {
                status: 0,
                received: 1,
                requested_start_time: 100,
                session_start_time: 100,
                transmitter_time: 160,
            }),
            RxMessage::SessionStop(SessionStopRx {
                status: 0,
                received: 1,
                session_stop_time: 900,
                session_start_time: 100,
                transmitter_time: 960,
            }),
            RxMessage::CalibrateGlucose(CalibrateGlucoseRx {
                status: 0,
                calibration_type: 1,
            }),
        ]
    }

    #[test]
    fn test_rx_round_trip() {
        for message in sample_messages() {
            let bytes = message.encode();
            assert_eq!(bytes[0], u8::from(message.opcode()));
            assert_eq!(RxMessage::decode(&bytes), Some(message), "{message:?}");
        }
    }

    #[test]
    fn test_encoded_lengths() {
        let lengths: Vec<usize> = sample_messages().iter().map(|m| m.encode().len()).collect();
        assert_eq!(lengths, vec![17, 3, 2, 16, 12, 10, 16, 14, 16, 19, 17, 17, 5]);
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        for message in sample_messages() {
            let bytes = message.encode();
            for len in 0..bytes.len() {
                let decoded = RxMessage::decode(&bytes[..len]);
                // A truncated G5 battery message is never a valid G6 one: the CRC moves.
                assert_eq!(decoded, None, "{message:?} truncated to {len}");
            }
        }
    }

    #[test]
    fn test_corrupted_crc_is_rejected() {
        for message in sample_messages() {
            let mut bytes = message.encode();
            let last = bytes.len() - 1;
            let has_crc = !matches!(
                message,
                RxMessage::AuthRequest(_) | RxMessage::AuthChallenge(_) | RxMessage::PairRequest(_)
            );
            if !has_crc {
                continue;
            }
            bytes[last] ^= 0x5A;
            assert_eq!(RxMessage::decode(&bytes), None);
            bytes[last] ^= 0x5A;
            bytes[last - 1] = bytes[last - 1].wrapping_add(1);
            assert_eq!(RxMessage::decode(&bytes), None);
        }
    }

    #[test]
    fn test_sensor_data_field_offsets() {
        let mut bytes = vec![
            0x2F, 0x00, 0x10, 0x27, 0x00, 0x00, 0x40, 0x52, 0x02, 0x00, 0x20, 0x4E, 0x02, 0x00,
        ];
        crate::wire::crc::append_crc(&mut bytes, ByteOrder::Little);
        let message = SensorDataRx::decode(&bytes).unwrap();
        assert_eq!(message.timestamp, 10_000);
        assert_eq!(message.unfiltered, 152_128);
        assert_eq!(message.filtered, Some(151_072));
    }

    #[test]
    fn test_short_sensor_data_has_no_filtered_count() {
        let mut bytes = vec![
            0x2F, 0x00, 0x10, 0x27, 0x00, 0x00, 0x40, 0x52, 0x02, 0x00, 0x00, 0x00,
        ];
        crate::wire::crc::append_crc(&mut bytes, ByteOrder::Little);
        assert_eq!(bytes.len(), 14);
        let message = SensorDataRx::try_decode(&bytes).unwrap();
        assert_eq!(message.timestamp, 10_000);
        assert_eq!(message.unfiltered, 152_128);
        assert_eq!(message.filtered, None);
        assert_eq!(
            RxMessage::decode(&bytes),
            Some(RxMessage::SensorData(message))
        );

        assert!(matches!(
            SensorDataRx::try_decode(&bytes[..13]),
            Err(DecodeError::TooShort {
                expected: 14,
                actual: 13
            })
        ));
    }

    #[test]
    fn test_wrong_opcode_with_valid_crc() {
        let glucose = GlucoseRx {
            status: 0,
            sequence: 1,
            timestamp: 2,
            glucose: 100,
            display_only: false,
            state: 6,
            trend: 0,
        }
        .encode();
        assert_eq!(
            SensorDataRx::try_decode(&glucose),
            Err(DecodeError::WrongOpcode {
                expected: 0x2F,
                actual: 0x31
            })
        );
    }

    #[test]
    fn test_unknown_and_tx_opcodes_are_ignored() {
        assert_eq!(RxMessage::decode(&[0xEE, 0x00, 0x00]), None);
        assert_eq!(RxMessage::decode(&TxMessage::SensorData.encode()), None);
        assert_eq!(RxMessage::decode(&[]), None);
    }

    #[test]
    fn test_fuzz_decode_never_panics() {
        let mut state: u32 = 0x1234_5678;
        for _ in 0..2_000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let len = (state % 24) as usize;
            let bytes: Vec<u8> = (0..len)
                .map(|i| state.rotate_left(i as u32).to_le_bytes()[i % 4])
                .collect();
            let _ = RxMessage::decode(&bytes);
        }
    }

    #[test]
    fn test_tx_encoding() {
        assert_eq!(TxMessage::SensorData.encode(), vec![0x2E, 0xAC, 0xC5]);
        assert_eq!(TxMessage::BatteryStatus.encode(), vec![0x22, 0x20, 0x04]);
        assert_eq!(TxMessage::TransmitterTime.encode(), vec![0x24, 0xE6, 0x64]);
        assert_eq!(TxMessage::KeepAlive { seconds: 25 }.encode(), vec![0x06, 25]);
        assert_eq!(TxMessage::BondRequest.encode(), vec![0x07]);

        let auth = TxMessage::AuthRequest {
            token: [9; 8],
            g6: true,
        }
        .encode();
        assert_eq!(auth.len(), 10);
        assert_eq!(auth[0], 0x02);
        assert_eq!(auth[9], 0x02);

        let start = TxMessage::SessionStart {
            start_time: 100,
            seconds_since_epoch: 1_700_000_000,
        }
        .encode();
        assert_eq!(start.len(), 11);
        assert!(crate::wire::has_valid_crc(&start, ByteOrder::Little));
    }

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::try_from(0x2F), Ok(Opcode::SensorDataRx));
        assert_eq!(Opcode::try_from(0xEE), Err(0xEE));
        assert_eq!(u8::from(Opcode::GlucoseG6Tx), 0x4E);
    }

    #[test]
    fn test_firmware_version_string() {
        let version = TransmitterVersionRx {
            status: 0,
            firmware: [1, 6, 5, 25],
            bt_firmware: [0; 4],
            hardware_rev: 0,
            other_firmware: [0; 6],
        };
        assert_eq!(version.firmware_version(), "1.6.5.25");
    }
}
