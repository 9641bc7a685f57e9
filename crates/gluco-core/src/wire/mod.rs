//! Wire codec for CGM transmitter messages.
//!
//! Every message is a fixed-width, offset-addressed binary record starting
//! with an opcode byte. Decoding validates, in order:
//!
//! 1. the minimum length of the message type,
//! 2. the trailing CRC-CCITT/XModem checksum (for types that carry one),
//! 3. the opcode,
//!
//! and then extracts named fields. Failures are routine on a radio link, so
//! [`TransmitterMessage::decode`] returns `None` rather than an error; the
//! reason is still available through [`TransmitterMessage::try_decode`].
//!
//! Families:
//!
//! - [`dexcom`] - Dexcom G5/G6 transmitters (little-endian fields and CRC)
//! - [`miaomiao`] - MiaoMiao Libre bridge (big-endian header fields, no CRC)

use thiserror::Error;
use tracing::trace;

pub mod bytes;
pub mod crc;
pub mod dexcom;
pub mod miaomiao;

pub use bytes::{ByteOrder, FieldReader};
pub use crc::{crc16_xmodem, has_valid_crc};

/// Why a byte buffer was not accepted as a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer is shorter than the message type requires.
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length of the message type.
        expected: usize,
        /// Length of the received buffer.
        actual: usize,
    },

    /// The trailing checksum does not match the payload.
    #[error("bad CRC: message carries {actual:#06x}, payload computes {expected:#06x}")]
    BadCrc {
        /// CRC computed over the payload.
        expected: u16,
        /// CRC carried in the last two bytes.
        actual: u16,
    },

    /// The first byte is not the opcode of the message type.
    #[error("wrong opcode: expected {expected:#04x}, got {actual:#04x}")]
    WrongOpcode {
        /// Opcode of the message type.
        expected: u8,
        /// First byte of the buffer.
        actual: u8,
    },
}

/// A fixed-layout message exchanged with a transmitter.
///
/// Implementors supply the layout constants and the body codec; framing,
/// validation and checksums are provided.
pub trait TransmitterMessage: Sized {
    /// First byte of every message of this type.
    const OPCODE: u8;

    /// Minimum total length, opcode and CRC included.
    const MIN_LEN: usize;

    /// Whether the last two bytes carry a CRC.
    const HAS_CRC: bool;

    /// Byte order of multi-byte fields and of the CRC.
    const BYTE_ORDER: ByteOrder;

    /// Extracts fields from a buffer that passed length, CRC and opcode checks.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::TooShort`] when a field lies beyond the buffer.
    fn decode_body(reader: &FieldReader<'_>) -> Result<Self, DecodeError>;

    /// Serializes fields, in declaration order, after the opcode.
    fn encode_body(&self, out: &mut Vec<u8>);

    /// Validates and decodes `bytes`, reporting why a buffer was rejected.
    ///
    /// # Errors
    ///
    /// Returns the first failed check: [`DecodeError::TooShort`],
    /// [`DecodeError::BadCrc`] or [`DecodeError::WrongOpcode`].
    fn try_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let too_short = DecodeError::TooShort {
            expected: Self::MIN_LEN.max(1),
            actual: bytes.len(),
        };
        if bytes.len() < Self::MIN_LEN {
            return Err(too_short);
        }

        if Self::HAS_CRC {
            let (_, carried, computed) =
                crc::split_crc(bytes, Self::BYTE_ORDER).ok_or(too_short)?;
            if carried != computed {
                return Err(DecodeError::BadCrc {
                    expected: computed,
                    actual: carried,
                });
            }
        }

        let opcode = *bytes.first().ok_or(too_short)?;
        if opcode != Self::OPCODE {
            return Err(DecodeError::WrongOpcode {
                expected: Self::OPCODE,
                actual: opcode,
            });
        }

        Self::decode_body(&FieldReader::new(bytes, Self::BYTE_ORDER))
    }

    /// Decodes `bytes`, or returns `None` if they are not a valid message.
    fn decode(bytes: &[u8]) -> Option<Self> {
        match Self::try_decode(bytes) {
            Ok(message) => Some(message),
            Err(reason) => {
                trace!(
                    opcode = Self::OPCODE,
                    len = bytes.len(),
                    %reason,
                    "Dropping undecodable packet"
                );
                None
            }
        }
    }

    /// Serializes the message: opcode, fields, then CRC when required.
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::MIN_LEN);
        out.push(Self::OPCODE);
        self.encode_body(&mut out);
        if Self::HAS_CRC {
            crc::append_crc(&mut out, Self::BYTE_ORDER);
        }
        out
    }
}
