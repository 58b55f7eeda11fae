// (c) 2025 The cachegw authors

//! Variable-length length codec and wire error taxonomy
//!
//! Lengths are encoded NDN-style: a value up to [`LENGTH1_MAX`] occupies the
//! first byte directly; otherwise a marker byte (`0xFD`/`0xFE`/`0xFF`)
//! announces a little-endian u16/u32/u64. Encoding is canonical: the decoder
//! rejects a wider encoding of a value that fits a narrower one, so a given
//! length has exactly one on-wire form.

use super::MAX_FIELD_SIZE;

/// Largest length that encodes into a single byte.
pub const LENGTH1_MAX: u8 = 252;
const LENGTH3_MARKER: u8 = 0xFD;
const LENGTH5_MARKER: u8 = 0xFE;
const LENGTH9_MARKER: u8 = 0xFF;

/// Errors arising from the wire codec and frame parser.
///
/// The stream framing has no outer length prefix, so a reader accumulating
/// bytes cannot always tell a short read from garbage. [`is_incomplete`]
/// makes the call: `InvalidMessage` and `Truncated` may resolve themselves
/// once more bytes arrive, the rest never will and must terminate the
/// connection.
///
/// [`is_incomplete`]: WireError::is_incomplete
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum WireError {
    /// Fewer bytes than a frame header.
    #[error("buffer shorter than a message header")]
    InvalidMessage,
    /// A declared length overruns the available bytes.
    #[error("declared field length overruns the buffer")]
    Truncated,
    /// The length encoding is malformed (non-canonical marker use).
    #[error("malformed length encoding")]
    InvalidLength,
    /// A declared field length exceeds [`MAX_FIELD_SIZE`].
    #[error("field of {0} bytes exceeds the {MAX_FIELD_SIZE} byte limit")]
    FieldTooLarge(u64),
}

impl WireError {
    /// Whether more bytes on the stream could turn this failure into a
    /// successful parse. Malformed input never recovers.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, WireError::InvalidMessage | WireError::Truncated)
    }
}

/// Decodes one length from the front of `buf`.
///
/// Returns the length and the number of bytes consumed.
pub fn decode_length(buf: &[u8]) -> Result<(u64, usize), WireError> {
    let Some(&first) = buf.first() else {
        return Err(WireError::Truncated);
    };
    match first {
        0..=LENGTH1_MAX => Ok((u64::from(first), 1)),
        LENGTH3_MARKER => {
            let Some(raw) = buf.get(1..3) else {
                return Err(WireError::Truncated);
            };
            let length = u64::from(u16::from_le_bytes([raw[0], raw[1]]));
            if length <= u64::from(LENGTH1_MAX) {
                return Err(WireError::InvalidLength);
            }
            Ok((length, 3))
        }
        LENGTH5_MARKER => {
            let Some(raw) = buf.get(1..5) else {
                return Err(WireError::Truncated);
            };
            let length = u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
            if length <= u64::from(u16::MAX) {
                return Err(WireError::InvalidLength);
            }
            Ok((length, 5))
        }
        LENGTH9_MARKER => {
            let Some(raw) = buf.get(1..9) else {
                return Err(WireError::Truncated);
            };
            let length = u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]);
            if length <= u64::from(u32::MAX) {
                return Err(WireError::InvalidLength);
            }
            Ok((length, 9))
        }
    }
}

/// Number of bytes [`encode_length`] will emit for `length`.
#[must_use]
pub fn encoded_length_size(length: u64) -> usize {
    if length <= u64::from(LENGTH1_MAX) {
        1
    } else if length <= u64::from(u16::MAX) {
        3
    } else if length <= u64::from(u32::MAX) {
        5
    } else {
        9
    }
}

/// Appends the canonical encoding of `length` to `out`.
#[allow(clippy::cast_possible_truncation)] // each arm range-checks first
pub fn encode_length(out: &mut Vec<u8>, length: u64) {
    if length <= u64::from(LENGTH1_MAX) {
        out.push(length as u8);
    } else if length <= u64::from(u16::MAX) {
        out.push(LENGTH3_MARKER);
        out.extend_from_slice(&(length as u16).to_le_bytes());
    } else if length <= u64::from(u32::MAX) {
        out.push(LENGTH5_MARKER);
        out.extend_from_slice(&(length as u32).to_le_bytes());
    } else {
        out.push(LENGTH9_MARKER);
        out.extend_from_slice(&length.to_le_bytes());
    }
}
