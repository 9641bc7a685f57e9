//! CRC-CCITT (XModem) checksums used by transmitter messages.
//!
//! Polynomial `0x1021`, initial value `0`, no reflection and no final xor.
//! The checksum always covers every byte of a message except the trailing
//! two bytes that carry it.

use super::bytes::ByteOrder;

const POLYNOMIAL: u16 = 0x1021;

/// Number of bytes a CRC occupies at the end of a message.
pub const CRC_LEN: usize = 2;

/// Computes the CRC-CCITT/XModem checksum of `data`.
#[must_use]
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ (u16::from(byte) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ POLYNOMIAL
            };
        }
        crc
    })
}

/// Appends the checksum of `buf` to it in the given byte order.
pub fn append_crc(buf: &mut Vec<u8>, order: ByteOrder) {
    let crc = crc16_xmodem(buf);
    order.put_u16(buf, crc);
}

/// Splits a message into its checksummed payload, the CRC carried by the
/// message, and the CRC computed over the payload.
///
/// Returns `None` when the message is too short to carry a CRC.
#[must_use]
pub fn split_crc(bytes: &[u8], order: ByteOrder) -> Option<(&[u8], u16, u16)> {
    let payload_len = bytes.len().checked_sub(CRC_LEN)?;
    let (payload, trailer) = bytes.split_at(payload_len);
    let carried = order.read_u16(trailer, 0)?;
    Some((payload, carried, crc16_xmodem(payload)))
}

/// Returns `true` when the trailing CRC of `bytes` matches its payload.
#[must_use]
pub fn has_valid_crc(bytes: &[u8], order: ByteOrder) -> bool {
    split_crc(bytes, order).is_some_and(|(_, carried, computed)| carried == computed)
}
