//! Reassembly of chunked text messages.
//!
//! Some devices send replies that exceed one BLE write. Each fragment starts
//! with a three-byte header:
//!
//! ```text
//! [0] : opcode
//! [1] : 1-based fragment index
//! [2] : total fragment count
//! [3..] : payload
//! ```
//!
//! Fragments are placed by index, so arrival order does not matter once all
//! of them are present. A gap longer than the configured staleness window
//! discards any partial message.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ReassemblyConfig;
use crate::error::{CoreError, Result};

/// Length of the fragment header.
pub const HEADER_LEN: usize = 3;

/// Highest fragment count the one-byte header can express.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Accumulates fragments of one message at a time. One instance per
/// connection.
#[derive(Debug, Clone)]
pub struct FragmentReassembler {
    stale_after: Duration,
    opcode: Option<u8>,
    slots: Vec<Option<Vec<u8>>>,
    last_fragment_at: Option<Instant>,
}

impl FragmentReassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new(config: &ReassemblyConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            opcode: None,
            slots: Vec::new(),
            last_fragment_at: None,
        }
    }

    /// Adds a fragment received now. See [`Self::add_fragment_at`].
    pub fn add_fragment(&mut self, bytes: &[u8]) -> bool {
        self.add_fragment_at(bytes, Instant::now())
    }

    /// Adds a fragment received at `at`.
    ///
    /// Returns `true` if the fragment was stored.
    pub fn add_fragment_at(&mut self, bytes: &[u8], at: Instant) -> bool {
        let &[opcode, index, total, ..] = bytes else {
            debug!(len = bytes.len(), "Ignoring fragment shorter than its header");
            return false;
        };

        if let Some(last) = self.last_fragment_at {
            let gap = at.saturating_duration_since(last);
            if gap > self.stale_after && !self.slots.is_empty() {
                debug!(
                    ?gap,
                    received = self.received(),
                    total = self.total(),
                    "Discarding stale partial message"
                );
                self.reset();
            }
        }

        if index == 0 || index > total {
            debug!(index, total, "Ignoring fragment with out-of-range index");
            return false;
        }

        let total = usize::from(total);
        if self.is_complete() {
            debug!(opcode, "Fragment after a complete message starts a new one");
            self.slots.clear();
        }
        if self.opcode != Some(opcode) || self.slots.len() != total {
            if !self.slots.is_empty() {
                debug!(
                    previous_opcode = self.opcode,
                    opcode, total, "New message started before the previous one completed"
                );
            }
            self.opcode = Some(opcode);
            self.slots = vec![None; total];
        }

        let slot = usize::from(index) - 1;
        self.slots[slot] = Some(bytes[HEADER_LEN..].to_vec());
        self.last_fragment_at = Some(at);
        true
    }

    /// Returns `true` once every fragment of the current message is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(Option::is_some)
    }

    /// Reassembled payload, or `None` while fragments are missing.
    #[must_use]
    pub fn get_complete_payload(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.slots.iter().flatten().flatten().copied().collect())
    }

    /// Reassembled UTF-8 text, or `None` while fragments are missing or if
    /// the payload is not valid UTF-8.
    #[must_use]
    pub fn get_complete_text(&self) -> Option<String> {
        String::from_utf8(self.get_complete_payload()?).ok()
    }

    /// Discards any partial message.
    pub fn reset(&mut self) {
        self.opcode = None;
        self.slots.clear();
        self.last_fragment_at = None;
    }

    /// Opcode of the message in progress.
    #[must_use]
    pub const fn opcode(&self) -> Option<u8> {
        self.opcode
    }

    /// Fragments received so far for the current message.
    #[must_use]
    pub fn received(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Declared fragment count of the current message, `0` when idle.
    #[must_use]
    pub fn total(&self) -> usize {
        self.slots.len()
    }
}

/// Splits `payload` into fragments no longer than `max_packet` bytes,
/// header included.
///
/// # Errors
///
/// Returns [`CoreError::PayloadTooLarge`] if the payload needs more than
/// [`MAX_FRAGMENTS`] fragments or `max_packet` leaves no room for payload.
pub fn split_into_fragments(
    opcode: u8,
    payload: &[u8],
    max_packet: usize,
) -> Result<Vec<Vec<u8>>> {
    let too_large = || CoreError::PayloadTooLarge {
        len: payload.len(),
        max_packet,
    };
    let chunk_len = max_packet
        .checked_sub(HEADER_LEN)
        .filter(|&n| n > 0)
        .ok_or_else(too_large)?;

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_len).collect()
    };
    let total = u8::try_from(chunks.len()).map_err(|_| too_large())?;

    Ok(chunks
        .into_iter()
        .zip(1..=total)
        .map(|(chunk, index)| {
            let mut fragment = Vec::with_capacity(HEADER_LEN + chunk.len());
            fragment.extend_from_slice(&[opcode, index, total]);
            fragment.extend_from_slice(chunk);
            fragment
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> FragmentReassembler {
        FragmentReassembler::new(&ReassemblyConfig::default())
    }

    fn fragments(text: &str) -> Vec<Vec<u8>> {
        split_into_fragments(0x0A, text.as_bytes(), 8).unwrap()
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut r = reassembler();
        let start = Instant::now();
        let parts = fragments("hello, world");
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert_eq!(r.get_complete_text(), None);
            assert!(r.add_fragment_at(part, start));
        }
        assert_eq!(r.get_complete_text().as_deref(), Some("hello, world"));
        assert_eq!(r.opcode(), Some(0x0A));
    }

    #[test]
    fn test_order_independence() {
        let parts = fragments("hello, world");
        let start = Instant::now();

        let mut in_order = reassembler();
        for part in &parts {
            in_order.add_fragment_at(part, start);
        }

        let mut shuffled = reassembler();
        shuffled.add_fragment_at(&parts[1], start);
        shuffled.add_fragment_at(&parts[2], start);
        assert_eq!(shuffled.received(), 2);
        assert_eq!(shuffled.get_complete_text(), None);
        shuffled.add_fragment_at(&parts[0], start);

        assert_eq!(shuffled.get_complete_text(), in_order.get_complete_text());
    }

    #[test]
    fn test_stale_gap_discards_partial_message() {
        let mut r = reassembler();
        let start = Instant::now();
        let old = split_into_fragments(0x0A, b"OLDOLDOLDOLD", 7).unwrap();
        let new = split_into_fragments(0x0A, b"new-new-new-", 7).unwrap();
        assert_eq!(old.len(), new.len());

        r.add_fragment_at(&old[0], start);
        r.add_fragment_at(&old[1], start + Duration::from_millis(50));

        let later = start + Duration::from_millis(500);
        r.add_fragment_at(&new[2], later);
        assert_eq!(r.received(), 1);
        assert_eq!(r.get_complete_text(), None);

        r.add_fragment_at(&new[0], later);
        r.add_fragment_at(&new[1], later + Duration::from_millis(10));
        assert_eq!(r.get_complete_text().as_deref(), Some("new-new-new-"));
    }

    #[test]
    fn test_gap_within_window_keeps_state() {
        let mut r = reassembler();
        let start = Instant::now();
        let parts = fragments("hello, world");
        r.add_fragment_at(&parts[0], start);
        r.add_fragment_at(&parts[1], start + Duration::from_millis(150));
        r.add_fragment_at(&parts[2], start + Duration::from_millis(300));
        assert_eq!(r.get_complete_text().as_deref(), Some("hello, world"));
    }

    #[test]
    fn test_invalid_fragments_are_ignored() {
        let mut r = reassembler();
        let now = Instant::now();
        assert!(!r.add_fragment_at(&[0x0A, 1], now));
        assert!(!r.add_fragment_at(&[0x0A, 0, 2, b'x'], now));
        assert!(!r.add_fragment_at(&[0x0A, 3, 2, b'x'], now));
        assert_eq!(r.total(), 0);
        assert_eq!(r.get_complete_payload(), None);
    }

    #[test]
    fn test_new_opcode_restarts_message() {
        let mut r = reassembler();
        let now = Instant::now();
        r.add_fragment_at(&[0x0A, 1, 2, b'a'], now);
        r.add_fragment_at(&[0x0B, 2, 2, b'z'], now);
        assert_eq!(r.opcode(), Some(0x0B));
        assert_eq!(r.received(), 1);
    }

    #[test]
    fn test_duplicate_index_overwrites() {
        let mut r = reassembler();
        let now = Instant::now();
        r.add_fragment_at(&[0x0A, 1, 2, b'a'], now);
        r.add_fragment_at(&[0x0A, 1, 2, b'b'], now);
        r.add_fragment_at(&[0x0A, 2, 2, b'c'], now);
        assert_eq!(r.get_complete_text().as_deref(), Some("bc"));
    }

    #[test]
    fn test_fragment_after_complete_message_starts_fresh() {
        let mut r = reassembler();
        let now = Instant::now();
        r.add_fragment_at(&[0x0A, 1, 2, b'o', b'l'], now);
        r.add_fragment_at(&[0x0A, 2, 2, b'd', b'!'], now);
        assert_eq!(r.get_complete_text().as_deref(), Some("old!"));

        r.add_fragment_at(&[0x0A, 2, 2, b'w', b'!'], now + Duration::from_millis(20));
        assert_eq!(r.received(), 1);
        assert_eq!(r.get_complete_text(), None);

        r.add_fragment_at(&[0x0A, 1, 2, b'n', b'e'], now + Duration::from_millis(40));
        assert_eq!(r.get_complete_text().as_deref(), Some("new!"));
    }

    #[test]
    fn test_invalid_utf8_is_none() {
        let mut r = reassembler();
        r.add_fragment_at(&[0x0A, 1, 1, 0xFF, 0xFE], Instant::now());
        assert!(r.is_complete());
        assert_eq!(r.get_complete_payload(), Some(vec![0xFF, 0xFE]));
        assert_eq!(r.get_complete_text(), None);
    }

    #[test]
    fn test_reset() {
        let mut r = reassembler();
        r.add_fragment_at(&[0x0A, 1, 1, b'x'], Instant::now());
        r.reset();
        assert_eq!(r.total(), 0);
        assert_eq!(r.opcode(), None);
        assert_eq!(r.get_complete_text(), None);
    }

    #[test]
    fn test_split_limits() {
        assert!(matches!(
            split_into_fragments(0x0A, b"abc", 3),
            Err(CoreError::PayloadTooLarge { .. })
        ));
        let payload = vec![b'x'; 256];
        assert!(split_into_fragments(0x0A, &payload, 4).is_err());
        assert_eq!(split_into_fragments(0x0A, &payload[..255], 4).unwrap().len(), 255);
        assert_eq!(split_into_fragments(0x0A, b"", 20).unwrap(), vec![vec![0x0A, 1, 1]]);
    }
}
