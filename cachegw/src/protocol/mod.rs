// (c) 2025 The cachegw authors

//! Wire protocol spoken between the compiler-cache client and the gateway
//!
//! # On-wire framing
//!
//! Every message is a single frame:
//!
//! ```text
//! [version: u8] [field_count: u8] [msg_type: u16 LE]   -- 4-byte header
//! [tag: u8] [length: varint LE] [data: length bytes]   -- zero or more fields
//! ```
//!
//! The length varint uses the NDN convention: values up to 252 are encoded
//! in the first byte; `0xFD`, `0xFE` and `0xFF` announce a following u16,
//! u32 or u64 (all little-endian). See [wire].
//!
//! `field_count` is advisory only; the parser re-counts fields from the
//! bytes. Response message types are the request type with bit 15 set.
//!
//! # Requests
//!
//! | Type | Mandatory fields | Response fields |
//! |------|------------------|-----------------|
//! | Setup (0x0001) | — (Version, BufferSize, OperationTimeout optional) | StatusCode, renegotiation fields on REDIRECT |
//! | Get (0x0002) | Key | StatusCode; Value (streamed) on SUCCESS |
//! | Put (0x0003) | Key, Value (Flags optional) | StatusCode |
//! | Delete (0x0004) | Key | StatusCode |
//!
//! A `Put` without a Flags field has only-if-missing semantics; setting the
//! OVERWRITE bit makes the write unconditional.

pub mod frame;
pub mod message;
pub mod serializer;
pub mod wire;

pub use frame::{Field, Frame};
pub use message::{Request, SetupParams};
pub use serializer::Serializer;
pub use wire::WireError;

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on the declared length of any single field.
///
/// Anything larger is malformed: it terminates the connection rather than
/// letting a hostile or confused peer grow the accumulator without bound.
pub const MAX_FIELD_SIZE: u64 = 256 * 1024 * 1024;

/// Frame header size on the wire.
pub const HEADER_SIZE: usize = 4;

/// Field tags.
pub mod tags {
    /// Raw cache key bytes.
    pub const KEY: u8 = 0x81;
    /// Object payload; streamed on Get responses.
    pub const VALUE: u8 = 0x82;
    /// u64 timestamp.
    pub const TIMESTAMP: u8 = 0x83;
    /// u8 [`StatusCode`](super::StatusCode), present in every response.
    pub const STATUS_CODE: u8 = 0x84;
    /// UTF-8 diagnostic accompanying an error status.
    pub const ERROR_MESSAGE: u8 = 0x85;
    /// u8 flags; bit 0 = OVERWRITE.
    pub const FLAGS: u8 = 0x86;

    /// Setup subfield: proposed protocol version (u8).
    pub const SETUP_VERSION: u8 = 0x01;
    /// Setup subfield: proposed socket buffer size (u32).
    pub const SETUP_BUFFER_SIZE: u8 = 0x02;
    /// Setup subfield: proposed operation timeout in milliseconds (u32).
    pub const SETUP_OPERATION_TIMEOUT: u8 = 0x03;
}

/// Message type discriminants.
pub mod msg_type {
    pub const SETUP: u16 = 0x0001;
    pub const GET: u16 = 0x0002;
    pub const PUT: u16 = 0x0003;
    pub const DELETE: u16 = 0x0004;

    /// Set on every response type.
    pub const RESPONSE_BIT: u16 = 0x8000;
}

/// Put Flags bit: replace an existing object unconditionally.
pub const FLAG_OVERWRITE: u8 = 0x01;

/// Normalized outcome reported in every response.
///
/// Backend-specific status (HTTP codes, cloud API errors) is folded into
/// this seven-valued code by
/// [`Backend::resolve_protocol_code`](crate::backend::Backend::resolve_protocol_code).
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    thiserror::Error,
    strum_macros::Display,
    strum_macros::FromRepr,
)]
#[repr(u8)]
pub enum StatusCode {
    /// Failure before the backend was reached.
    LocalError = 0,
    /// The object does not exist.
    NoFile = 1,
    /// The backend did not answer in time.
    Timeout = 2,
    /// Provisional backend answer; retry later.
    SigWait = 3,
    /// Operation completed.
    Success = 4,
    /// The peer should re-negotiate with the echoed parameters.
    Redirect = 5,
    /// Backend-reported failure.
    Error = 6,
}

impl From<StatusCode> for u8 {
    fn from(value: StatusCode) -> Self {
        value as u8
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::StatusCode;

    #[test]
    fn status_code_repr_is_wire_stable() {
        // These values appear on the wire; they can never be reordered.
        assert_eq!(StatusCode::LocalError as u8, 0);
        assert_eq!(StatusCode::NoFile as u8, 1);
        assert_eq!(StatusCode::Timeout as u8, 2);
        assert_eq!(StatusCode::SigWait as u8, 3);
        assert_eq!(StatusCode::Success as u8, 4);
        assert_eq!(StatusCode::Redirect as u8, 5);
        assert_eq!(StatusCode::Error as u8, 6);
    }

    #[test]
    fn status_code_from_repr() {
        assert_eq!(StatusCode::from_repr(4), Some(StatusCode::Success));
        assert_eq!(StatusCode::from_repr(7), None);
    }
}
