//! # Core CoAP Types (RFC 7252 Section 3)
//!
//! Fundamental message-layer types shared by the codec and the runtime.

use core::fmt;

/// Wire protocol version. The version field is fixed at 1; datagrams
/// carrying any other value are silently ignored per RFC 7252 Section 3.
pub const VERSION: u8 = 1;

/// Message ID: 16-bit transport-layer identifier matching an ACK or RST
/// to its confirmable message. Wraps modulo 2^16.
pub type MessageId = u16;

/// CoAP message type (RFC 7252 Section 4.2, 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Requires an Acknowledgement or Reset; retransmitted until one arrives.
    Confirmable,
    /// Fire-and-forget; never acknowledged.
    NonConfirmable,
    /// Acknowledges a confirmable message, optionally carrying a
    /// piggybacked response.
    Acknowledgement,
    /// Rejects a message the receiver cannot or will not process.
    Reset,
}

impl MessageType {
    /// Decode the two-bit wire field.
    pub fn from_wire(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    /// Encode as the two-bit wire field.
    pub fn to_wire(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Maximum token length in bytes (RFC 7252 Section 3; TKL values 9-15
/// are reserved).
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Client-generated opaque correlator matching a response to its request.
///
/// Tokens are at most 8 bytes and are stored inline, making the type
/// `Copy` and cheap to use as a map key in the token registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LENGTH],
}

impl Token {
    /// Create a token from a byte slice.
    ///
    /// Returns `None` if the slice is longer than [`MAX_TOKEN_LENGTH`].
    pub fn new(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_TOKEN_LENGTH {
            return None;
        }
        let mut bytes = [0u8; MAX_TOKEN_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Some(Self {
            len: slice.len() as u8,
            bytes,
        })
    }

    /// The zero-length token.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Access the token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length of the token in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this is the zero-length token.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:02x?})", self.as_bytes())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Content-Format registry values (RFC 7252 Section 12.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    pub const LINK_FORMAT: ContentFormat = ContentFormat(40);
    pub const XML: ContentFormat = ContentFormat(41);
    pub const OCTET_STREAM: ContentFormat = ContentFormat(42);
    pub const EXI: ContentFormat = ContentFormat(47);
    pub const JSON: ContentFormat = ContentFormat(50);
    pub const CBOR: ContentFormat = ContentFormat(60);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_roundtrip() {
        for ty in [
            MessageType::Confirmable,
            MessageType::NonConfirmable,
            MessageType::Acknowledgement,
            MessageType::Reset,
        ] {
            assert_eq!(MessageType::from_wire(ty.to_wire()), ty);
        }
    }

    #[test]
    fn test_token_bounds() {
        assert!(Token::new(&[]).is_some());
        assert!(Token::new(&[0u8; 8]).is_some());
        assert!(Token::new(&[0u8; 9]).is_none());
    }

    #[test]
    fn test_token_equality_ignores_spare_bytes() {
        let a = Token::new(&[1, 2, 3]).unwrap();
        let b = Token::new(&[1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), &[1, 2, 3]);
        assert_eq!(format!("{}", a), "010203");
    }
}
