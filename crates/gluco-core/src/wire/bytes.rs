//! Bounds-checked fixed-offset field access.

use super::DecodeError;

/// Byte order of multi-byte fields within a message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    Little,
}

impl ByteOrder {
    /// Reads a `u16` at `offset`, or `None` when it would run past the end.
    #[must_use]
    pub fn read_u16(self, bytes: &[u8], offset: usize) -> Option<u16> {
        let raw: [u8; 2] = bytes.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            Self::Big => u16::from_be_bytes(raw),
            Self::Little => u16::from_le_bytes(raw),
        })
    }

    /// Reads a `u32` at `offset`, or `None` when it would run past the end.
    #[must_use]
    pub fn read_u32(self, bytes: &[u8], offset: usize) -> Option<u32> {
        let raw: [u8; 4] = bytes.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Self::Big => u32::from_be_bytes(raw),
            Self::Little => u32::from_le_bytes(raw),
        })
    }

    /// Appends a `u16` to `buf`.
    pub fn put_u16(self, buf: &mut Vec<u8>, value: u16) {
        match self {
            Self::Big => buf.extend_from_slice(&value.to_be_bytes()),
            Self::Little => buf.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Appends a `u32` to `buf`.
    pub fn put_u32(self, buf: &mut Vec<u8>, value: u32) {
        match self {
            Self::Big => buf.extend_from_slice(&value.to_be_bytes()),
            Self::Little => buf.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Reads named fields out of a message that already passed length, CRC and
/// opcode validation. Every accessor is still bounds-checked so a layout
/// mistake surfaces as [`DecodeError::TooShort`] instead of a panic.
#[derive(Debug, Clone, Copy)]
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl<'a> FieldReader<'a> {
    /// Wraps `bytes`, reading multi-byte fields in `order`.
    #[must_use]
    pub const fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    /// Total length of the underlying message, including opcode and CRC.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the underlying message is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    const fn too_short(&self, end: usize) -> DecodeError {
        DecodeError::TooShort {
            expected: end,
            actual: self.bytes.len(),
        }
    }

    /// Single byte at `offset`.
    pub fn u8(&self, offset: usize) -> Result<u8, DecodeError> {
        self.bytes
            .get(offset)
            .copied()
            .ok_or_else(|| self.too_short(offset + 1))
    }

    /// Signed byte at `offset`.
    pub fn i8(&self, offset: usize) -> Result<i8, DecodeError> {
        self.u8(offset).map(|b| i8::from_ne_bytes([b]))
    }

    /// `u16` at `offset` in the family byte order.
    pub fn u16(&self, offset: usize) -> Result<u16, DecodeError> {
        self.order
            .read_u16(self.bytes, offset)
            .ok_or_else(|| self.too_short(offset + 2))
    }

    /// `u32` at `offset` in the family byte order.
    pub fn u32(&self, offset: usize) -> Result<u32, DecodeError> {
        self.order
            .read_u32(self.bytes, offset)
            .ok_or_else(|| self.too_short(offset + 4))
    }

    /// Fixed-size byte range starting at `offset`.
    pub fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N], DecodeError> {
        self.bytes
            .get(offset..offset + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| self.too_short(offset + N))
    }

    /// Byte range `offset..offset + len` as a slice.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        self.bytes
            .get(offset..offset + len)
            .ok_or_else(|| self.too_short(offset + len))
    }
}
