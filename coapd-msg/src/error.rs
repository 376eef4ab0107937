//! Error types for CoAP message parsing and serialization.

use thiserror::Error;

/// Errors produced while decoding a datagram into a message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The datagram ended before a complete field could be read.
    #[error("datagram truncated")]
    Truncated,

    /// Version field was not 1. Such datagrams must be silently ignored
    /// (RFC 7252 Section 3).
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    /// Nibble value 15 used as an option delta or length (RFC 7252
    /// Section 3.1 reserves it outside the payload marker).
    #[error("reserved option nibble 15")]
    ReservedNibble,

    /// Cumulative option deltas exceeded the 16-bit option number space.
    #[error("option number overflow")]
    OptionOverflow,

    /// Header declared a token longer than 8 bytes.
    #[error("token length {0} exceeds 8")]
    InvalidToken(u8),

    /// Datagram larger than the configured maximum message size.
    #[error("message of {len} bytes exceeds limit of {limit}")]
    MessageTooLarge { len: usize, limit: usize },

    /// A payload marker (0xFF) was present but not followed by any bytes.
    #[error("payload marker with empty payload")]
    MissingPayload,
}

/// Errors produced while serializing a message into a datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The output buffer cannot hold the serialized message.
    #[error("buffer of {capacity} bytes too small, {needed} required")]
    BufferTooSmall { capacity: usize, needed: usize },

    /// An option value violates the length bounds of its registry entry.
    #[error("option {number} value of {len} bytes outside {min}..={max}")]
    InvalidOption {
        number: u16,
        len: usize,
        min: usize,
        max: usize,
    },

    /// Token longer than 8 bytes.
    #[error("token length {0} exceeds 8")]
    InvalidToken(usize),
}
