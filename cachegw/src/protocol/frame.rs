// (c) 2025 The cachegw authors

//! Zero-copy frame parser
//!
//! [`Frame::parse`] walks an immutable byte buffer and yields fields whose
//! payloads are borrowed slices into that buffer. Nothing is copied; the
//! frame (and everything read out of it) is only valid while the buffer is.

use super::wire::{self, WireError};
use super::{HEADER_SIZE, MAX_FIELD_SIZE};

/// One TLV field, borrowing its payload from the parsed buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Field<'a> {
    /// Semantic identifier; see [`tags`](super::tags).
    pub tag: u8,
    /// Opaque payload.
    pub data: &'a [u8],
}

impl<'a> Field<'a> {
    /// Payload as UTF-8, lossily.
    #[must_use]
    pub fn as_str(&self) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.data)
    }

    /// First payload byte, if any.
    #[must_use]
    pub fn as_u8(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Payload as a little-endian u32.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        let raw: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// Payload as a little-endian u64.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        let raw: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }

    /// Truthiness of the first payload byte; empty is false.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        self.data.first().is_some_and(|b| *b != 0)
    }
}

/// A parsed message frame.
///
/// `field_count` is what the peer declared; the authoritative count is
/// `fields().len()`, re-counted from the bytes.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Protocol version from the header.
    pub version: u8,
    /// Declared field count (advisory).
    pub field_count: u8,
    /// Message discriminant.
    pub msg_type: u16,
    fields: Vec<Field<'a>>,
}

impl<'a> Frame<'a> {
    /// Parses a complete frame out of `buf`.
    ///
    /// The buffer must hold exactly one frame: fields are consumed until the
    /// buffer is exhausted. On any error no partial frame is returned;
    /// [`WireError::is_incomplete`] tells the caller whether more bytes could
    /// still complete the frame.
    pub fn parse(buf: &'a [u8]) -> Result<Frame<'a>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InvalidMessage);
        }
        let version = buf[0];
        let field_count = buf[1];
        let msg_type = u16::from_le_bytes([buf[2], buf[3]]);

        let mut fields = Vec::with_capacity(4); // covers every defined message shape
        let mut pos = HEADER_SIZE;
        while pos < buf.len() {
            let tag = buf[pos];
            pos += 1;

            let (length, consumed) = wire::decode_length(&buf[pos..])?;
            if length > MAX_FIELD_SIZE {
                return Err(WireError::FieldTooLarge(length));
            }
            pos += consumed;

            let end = pos
                .checked_add(usize::try_from(length).map_err(|_| WireError::FieldTooLarge(length))?)
                .ok_or(WireError::FieldTooLarge(length))?;
            if end > buf.len() {
                return Err(WireError::Truncated);
            }

            fields.push(Field {
                tag,
                data: &buf[pos..end],
            });
            pos = end;
        }

        Ok(Frame {
            version,
            field_count,
            msg_type,
            fields,
        })
    }

    /// All fields, in wire order.
    #[must_use]
    pub fn fields(&self) -> &[Field<'a>] {
        &self.fields
    }

    /// First field carrying `tag`, if any.
    ///
    /// Duplicate tags are tolerated by reading only the first occurrence.
    #[must_use]
    pub fn find_field(&self, tag: u8) -> Option<&Field<'a>> {
        self.fields.iter().find(|f| f.tag == tag)
    }
}
