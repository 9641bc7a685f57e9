//! MiaoMiao Libre bridge messages.
//!
//! The bridge streams one large response per reading cycle. Header fields
//! are big-endian and the frame carries no CRC; completeness is judged by
//! the declared packet length instead.
//!
//! # Data packet layout (363 bytes)
//!
//! ```text
//! [0]        : 0x28
//! [1-2]      : declared packet length (u16)
//! [3-4]      : reserved
//! [5-12]     : sensor UID
//! [13]       : battery percent
//! [14-15]    : firmware version (u16)
//! [16-17]    : hardware version (u16)
//! [18-361]   : sensor memory (344 opaque bytes)
//! [362]      : 0x29 end marker
//! ```

use super::{ByteOrder, DecodeError, FieldReader, TransmitterMessage};
use tracing::trace;

const ORDER: ByteOrder = ByteOrder::Big;

/// Opcode of a sensor data packet.
pub const DATA_PACKET: u8 = 0x28;
/// Sent when no sensor is in range of the bridge.
pub const SENSOR_NOT_DETECTED: u8 = 0x32;
/// Sent when the bridge sees a sensor it has not been allowed to read.
pub const NEW_SENSOR: u8 = 0x34;

const END_MARKER: u8 = 0x29;
const HEADER_LEN: usize = 18;

/// Length of the opaque sensor memory block.
pub const MEMORY_LEN: usize = 344;

/// One full sensor read relayed by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiaoMiaoPacket {
    /// UID of the sensor under the bridge.
    pub sensor_uid: [u8; 8],
    /// Bridge battery level.
    pub battery_percent: u8,
    /// Bridge firmware version.
    pub firmware: u16,
    /// Bridge hardware version.
    pub hardware: u16,
    /// Sensor memory, still encrypted for sensors that need it.
    pub memory: Vec<u8>,
}

impl MiaoMiaoPacket {
    /// Total length of a data packet on the wire.
    pub const PACKET_LEN: usize = HEADER_LEN + MEMORY_LEN + 1;
}

impl TransmitterMessage for MiaoMiaoPacket {
    const OPCODE: u8 = DATA_PACKET;
    const MIN_LEN: usize = Self::PACKET_LEN;
    const HAS_CRC: bool = false;
    const BYTE_ORDER: ByteOrder = ORDER;

    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError> {
        let declared = usize::from(reader.u16(1)?);
        if reader.len() < declared {
            return Err(DecodeError::TooShort {
                expected: declared,
                actual: reader.len(),
            });
        }
        Ok(Self {
            sensor_uid: reader.array(5)?,
            battery_percent: reader.u8(13)?,
            firmware: reader.u16(14)?,
            hardware: reader.u16(16)?,
            memory: reader.slice(HEADER_LEN, MEMORY_LEN)?.to_vec(),
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        let declared = u16::try_from(Self::PACKET_LEN).unwrap_or(u16::MAX);
        ORDER.put_u16(out, declared);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.sensor_uid);
        out.push(self.battery_percent);
        ORDER.put_u16(out, self.firmware);
        ORDER.put_u16(out, self.hardware);
        out.extend(self.memory.iter().copied().chain(std::iter::repeat(0)).take(MEMORY_LEN));
        out.push(END_MARKER);
    }
}

/// Any response from the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiaoMiaoResponse {
    /// A complete sensor read.
    Data(MiaoMiaoPacket),
    /// No sensor in range.
    SensorNotDetected,
    /// A sensor that needs [`MiaoMiaoCommand::AllowNewSensor`] first.
    NewSensor,
}

impl MiaoMiaoResponse {
    /// Routes `bytes` on the first byte. Returns `None` for unknown
    /// responses and for data packets that are not complete yet.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match *bytes.first()? {
            DATA_PACKET => MiaoMiaoPacket::decode(bytes).map(Self::Data),
            SENSOR_NOT_DETECTED => Some(Self::SensorNotDetected),
            NEW_SENSOR => Some(Self::NewSensor),
            other => {
                trace!(opcode = other, "Dropping unknown bridge response");
                None
            }
        }
    }
}

/// Commands accepted by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiaoMiaoCommand {
    /// Ask for a sensor read now.
    StartReading,
    /// Lets the bridge read a sensor it reported as new.
    AllowNewSensor,
    /// Change how often the bridge reads the sensor on its own.
    SetInterval {
        /// Minutes between reads.
        minutes: u8,
    },
}

impl MiaoMiaoCommand {
    /// Reading interval used unless the caller asks for another.
    pub const DEFAULT_INTERVAL_MINUTES: u8 = 5;

    /// Serializes the command.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::StartReading => vec![0xF0],
            Self::AllowNewSensor => vec![0xD3, 0x01],
            Self::SetInterval { minutes } => vec![0xD1, minutes],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> MiaoMiaoPacket {
        MiaoMiaoPacket {
            sensor_uid: [0xE0, 0x07, 0xA0, 0x00, 0x12, 0x34, 0x56, 0x78],
            battery_percent: 87,
            firmware: 0x0039,
            hardware: 0x0001,
            memory: (0..MEMORY_LEN).map(|i| (i % 251) as u8).collect(),
        }
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = sample_packet();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 363);
        assert_eq!(&bytes[1..3], &[0x01, 0x6B]);
        assert_eq!(bytes[13], 87);
        assert_eq!(bytes[362], 0x29);
        assert_eq!(
            MiaoMiaoResponse::decode(&bytes),
            Some(MiaoMiaoResponse::Data(packet))
        );
    }

    #[test]
    fn test_header_fields_are_big_endian() {
        let mut bytes = sample_packet().encode();
        bytes[14] = 0x12;
        bytes[15] = 0x34;
        let packet = MiaoMiaoPacket::decode(&bytes).unwrap();
        assert_eq!(packet.firmware, 0x1234);
    }

    #[test]
    fn test_incomplete_packet_is_none() {
        let bytes = sample_packet().encode();
        for len in [0, 1, 18, 200, 362] {
            assert_eq!(MiaoMiaoResponse::decode(&bytes[..len]), None, "len {len}");
        }
    }

    #[test]
    fn test_declared_length_beyond_buffer_is_rejected() {
        let mut bytes = sample_packet().encode();
        bytes[1] = 0x02;
        assert!(matches!(
            MiaoMiaoPacket::try_decode(&bytes),
            Err(DecodeError::TooShort { actual: 363, .. })
        ));
    }

    #[test]
    fn test_status_responses() {
        assert_eq!(
            MiaoMiaoResponse::decode(&[0x32]),
            Some(MiaoMiaoResponse::SensorNotDetected)
        );
        assert_eq!(
            MiaoMiaoResponse::decode(&[0x34]),
            Some(MiaoMiaoResponse::NewSensor)
        );
        assert_eq!(MiaoMiaoResponse::decode(&[0x99]), None);
    }

    #[test]
    fn test_commands() {
        assert_eq!(MiaoMiaoCommand::StartReading.encode(), vec![0xF0]);
        assert_eq!(MiaoMiaoCommand::AllowNewSensor.encode(), vec![0xD3, 0x01]);
        assert_eq!(
            MiaoMiaoCommand::SetInterval {
                minutes: MiaoMiaoCommand::DEFAULT_INTERVAL_MINUTES
            }
            .encode(),
            vec![0xD1, 0x05]
        );
    }
}
