//! # Block Option Arithmetic (RFC 7959 Section 2.2)
//!
//! Block1 and Block2 carry a single unsigned integer packing the block
//! number, the "more blocks follow" flag and the block size exponent:
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          NUM (up to 20 bits)          |M| SZX |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::Bytes;
use thiserror::Error;

use crate::option;

/// Largest representable block number (20 bits).
pub const MAX_BLOCK_NUMBER: u32 = (1 << 20) - 1;

/// Errors for malformed block option values.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// SZX value 7 is reserved (RFC 7959 Section 2.2).
    #[error("reserved block size exponent 7")]
    ReservedSzx,

    /// Block number does not fit in 20 bits.
    #[error("block number {0} exceeds 20 bits")]
    NumberTooLarge(u32),

    /// Option value wider than the 3 bytes a block option may occupy.
    #[error("block option value too long")]
    ValueTooLong,
}

/// Block size exponent: block size in bytes is `2^(szx + 4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Szx {
    S16 = 0,
    S32 = 1,
    S64 = 2,
    S128 = 3,
    S256 = 4,
    S512 = 5,
    S1024 = 6,
}

impl Szx {
    /// Decode the 3-bit wire field, rejecting the reserved value 7.
    pub fn from_wire(bits: u8) -> Result<Self, BlockError> {
        match bits & 0x07 {
            0 => Ok(Szx::S16),
            1 => Ok(Szx::S32),
            2 => Ok(Szx::S64),
            3 => Ok(Szx::S128),
            4 => Ok(Szx::S256),
            5 => Ok(Szx::S512),
            6 => Ok(Szx::S1024),
            _ => Err(BlockError::ReservedSzx),
        }
    }

    /// The largest exponent whose block size does not exceed `size`.
    /// Sizes below 16 clamp to [`Szx::S16`].
    pub fn fitting(size: usize) -> Self {
        let mut szx = Szx::S16;
        for candidate in [
            Szx::S32,
            Szx::S64,
            Szx::S128,
            Szx::S256,
            Szx::S512,
            Szx::S1024,
        ] {
            if candidate.size() <= size {
                szx = candidate;
            }
        }
        szx
    }

    /// Block size in bytes: 16..=1024.
    pub const fn size(self) -> usize {
        1 << (self as usize + 4)
    }
}

/// A decoded Block1/Block2 option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockValue {
    /// Zero-based block index.
    pub num: u32,
    /// Whether more blocks follow this one.
    pub more: bool,
    /// Negotiated block size exponent.
    pub szx: Szx,
}

impl BlockValue {
    /// Build a block value, validating the block number range.
    pub fn new(num: u32, more: bool, szx: Szx) -> Result<Self, BlockError> {
        if num > MAX_BLOCK_NUMBER {
            return Err(BlockError::NumberTooLarge(num));
        }
        Ok(Self { num, more, szx })
    }

    /// Byte offset of this block within the reassembled payload.
    pub fn offset(&self) -> usize {
        self.num as usize * self.szx.size()
    }

    /// Pack into the `NUM << 4 | M << 3 | SZX` integer form.
    pub fn to_raw(self) -> u32 {
        self.num << 4 | (self.more as u32) << 3 | self.szx as u32
    }

    /// Unpack from the integer form.
    pub fn from_raw(raw: u32) -> Result<Self, BlockError> {
        let szx = Szx::from_wire((raw & 0x07) as u8)?;
        BlockValue::new(raw >> 4, raw & 0x08 != 0, szx)
    }

    /// Serialize as a uint option value.
    pub fn to_option_value(self) -> Bytes {
        option::encode_uint(self.to_raw())
    }

    /// Parse from a uint option value.
    pub fn from_option_value(value: &[u8]) -> Result<Self, BlockError> {
        if value.len() > 3 {
            return Err(BlockError::ValueTooLong);
        }
        let raw = option::decode_uint(value).ok_or(BlockError::ValueTooLong)?;
        Self::from_raw(raw)
    }
}
