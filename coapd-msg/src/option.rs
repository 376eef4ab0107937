//! # Option Registry (RFC 7252 Section 5.10, RFC 7959, RFC 7641)
//!
//! Static registry of known option numbers with their value format,
//! repeatability and length bounds, plus the class predicates (critical,
//! unsafe, no-cache-key) that derive from bits of the option number.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EncodeError;

// Known option numbers.
pub const IF_MATCH: u16 = 1;
pub const URI_HOST: u16 = 3;
pub const ETAG: u16 = 4;
pub const IF_NONE_MATCH: u16 = 5;
pub const OBSERVE: u16 = 6;
pub const URI_PORT: u16 = 7;
pub const LOCATION_PATH: u16 = 8;
pub const URI_PATH: u16 = 11;
pub const CONTENT_FORMAT: u16 = 12;
pub const MAX_AGE: u16 = 14;
pub const URI_QUERY: u16 = 15;
pub const ACCEPT: u16 = 17;
pub const LOCATION_QUERY: u16 = 20;
pub const BLOCK2: u16 = 23;
pub const BLOCK1: u16 = 27;
pub const SIZE2: u16 = 28;
pub const PROXY_URI: u16 = 35;
pub const PROXY_SCHEME: u16 = 39;
pub const SIZE1: u16 = 60;

/// Value format of an option (RFC 7252 Section 3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// Zero-length value.
    Empty,
    /// Opaque byte string.
    Opaque,
    /// Unsigned integer, minimal-length big-endian (zero encodes as empty).
    Uint,
    /// UTF-8 string.
    String,
}

/// Registry entry describing one option number.
#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub number: u16,
    pub name: &'static str,
    pub format: ValueFormat,
    pub repeatable: bool,
    pub min_len: usize,
    pub max_len: usize,
}

impl OptionDef {
    const fn new(
        number: u16,
        name: &'static str,
        format: ValueFormat,
        repeatable: bool,
        min_len: usize,
        max_len: usize,
    ) -> Self {
        Self {
            number,
            name,
            format,
            repeatable,
            min_len,
            max_len,
        }
    }
}

/// The static registry, in ascending option-number order.
static REGISTRY: &[OptionDef] = &[
    OptionDef::new(IF_MATCH, "If-Match", ValueFormat::Opaque, true, 0, 8),
    OptionDef::new(URI_HOST, "Uri-Host", ValueFormat::String, false, 1, 255),
    OptionDef::new(ETAG, "ETag", ValueFormat::Opaque, true, 1, 8),
    OptionDef::new(IF_NONE_MATCH, "If-None-Match", ValueFormat::Empty, false, 0, 0),
    OptionDef::new(OBSERVE, "Observe", ValueFormat::Uint, false, 0, 3),
    OptionDef::new(URI_PORT, "Uri-Port", ValueFormat::Uint, false, 0, 2),
    OptionDef::new(LOCATION_PATH, "Location-Path", ValueFormat::String, true, 0, 255),
    OptionDef::new(URI_PATH, "Uri-Path", ValueFormat::String, true, 0, 255),
    OptionDef::new(CONTENT_FORMAT, "Content-Format", ValueFormat::Uint, false, 0, 2),
    OptionDef::new(MAX_AGE, "Max-Age", ValueFormat::Uint, false, 0, 4),
    OptionDef::new(URI_QUERY, "Uri-Query", ValueFormat::String, true, 0, 255),
    OptionDef::new(ACCEPT, "Accept", ValueFormat::Uint, false, 0, 2),
    OptionDef::new(LOCATION_QUERY, "Location-Query", ValueFormat::String, true, 0, 255),
    OptionDef::new(BLOCK2, "Block2", ValueFormat::Uint, false, 0, 3),
    OptionDef::new(BLOCK1, "Block1", ValueFormat::Uint, false, 0, 3),
    OptionDef::new(SIZE2, "Size2", ValueFormat::Uint, false, 0, 4),
    OptionDef::new(PROXY_URI, "Proxy-Uri", ValueFormat::String, false, 1, 1034),
    OptionDef::new(PROXY_SCHEME, "Proxy-Scheme", ValueFormat::String, false, 1, 255),
    OptionDef::new(SIZE1, "Size1", ValueFormat::Uint, false, 0, 4),
];

/// Look up the registry entry for an option number.
pub fn lookup(number: u16) -> Option<&'static OptionDef> {
    REGISTRY
        .binary_search_by_key(&number, |def| def.number)
        .ok()
        .map(|idx| &REGISTRY[idx])
}

/// Value format of a known option number.
pub fn format_of(number: u16) -> Option<ValueFormat> {
    lookup(number).map(|def| def.format)
}

/// Whether an option number may appear more than once in a message.
/// Unknown numbers are treated as non-repeatable.
pub fn is_repeatable(number: u16) -> bool {
    lookup(number).map(|def| def.repeatable).unwrap_or(false)
}

/// Critical options must be understood by the receiver (bit 0 of the
/// option number, RFC 7252 Section 5.4.1).
pub const fn is_critical(number: u16) -> bool {
    number & 0x01 != 0
}

/// Unsafe options must not be forwarded by an unaware proxy (bit 1,
/// RFC 7252 Section 5.4.2).
pub const fn is_unsafe(number: u16) -> bool {
    number & 0x02 != 0
}

/// NoCacheKey options do not participate in the request fingerprint used
/// to key block-wise transfer state. The class derives from the option
/// number bit pattern (RFC 7252 Section 5.4.2); the Block options are
/// additionally excluded per RFC 7959 Section 2.4.
pub const fn is_no_cache_key(number: u16) -> bool {
    (number & 0x1e) == 0x1c || number == BLOCK1 || number == BLOCK2
}

/// Whether an unknown option number would be recognised by this endpoint.
pub fn is_known(number: u16) -> bool {
    lookup(number).is_some()
}

/// Validate an option value against its registry entry.
///
/// Unknown option numbers pass validation here; criticality of unknown
/// options is enforced at the request-routing layer, not the codec.
pub fn validate(number: u16, value: &[u8]) -> Result<(), EncodeError> {
    let Some(def) = lookup(number) else {
        return Ok(());
    };
    if value.len() < def.min_len || value.len() > def.max_len {
        return Err(EncodeError::InvalidOption {
            number,
            len: value.len(),
            min: def.min_len,
            max: def.max_len,
        });
    }
    Ok(())
}

/// Encode a uint option value as minimal-length big-endian bytes.
/// Zero encodes as the empty value (RFC 7252 Section 3.2).
pub fn encode_uint(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    let mut started = false;
    for shift in [24u32, 16, 8, 0] {
        let byte = (value >> shift) as u8;
        if byte != 0 || started {
            buf.put_u8(byte);
            started = true;
        }
    }
    buf.freeze()
}

/// Decode a uint option value from minimal-length big-endian bytes.
/// Returns `None` for values wider than 32 bits.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    let mut out = 0u32;
    for &byte in value {
        out = out << 8 | byte as u32;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_sorted() {
        for pair in REGISTRY.windows(2) {
            assert!(pair[0].number < pair[1].number);
        }
    }

    #[test]
    fn test_lookup_known_numbers() {
        assert_eq!(lookup(URI_PATH).unwrap().name, "Uri-Path");
        assert_eq!(format_of(CONTENT_FORMAT), Some(ValueFormat::Uint));
        assert!(is_repeatable(URI_QUERY));
        assert!(!is_repeatable(CONTENT_FORMAT));
        assert!(lookup(2).is_none());
    }

    #[test]
    fn test_option_classes() {
        // Odd numbers are critical.
        assert!(is_critical(IF_MATCH));
        assert!(is_critical(URI_PATH));
        assert!(!is_critical(CONTENT_FORMAT));
        assert!(!is_critical(ETAG));

        // Proxy-Uri is critical, unsafe.
        assert!(is_critical(PROXY_URI));
        assert!(is_unsafe(PROXY_URI));
        assert!(!is_unsafe(URI_PATH));

        // Size1/Size2 carry the NoCacheKey bit pattern; the Block options
        // are excluded from the cache key explicitly.
        assert!(is_no_cache_key(SIZE1));
        assert!(is_no_cache_key(SIZE2));
        assert!(is_no_cache_key(BLOCK1));
        assert!(is_no_cache_key(BLOCK2));
        assert!(!is_no_cache_key(URI_PATH));
        assert!(!is_no_cache_key(OBSERVE));
    }

    #[test]
    fn test_validate_length_bounds() {
        assert!(validate(URI_HOST, b"example.com").is_ok());
        assert!(validate(URI_HOST, b"").is_err());
        assert!(validate(ETAG, &[0u8; 9]).is_err());
        assert!(validate(IF_NONE_MATCH, &[]).is_ok());
        assert!(validate(IF_NONE_MATCH, &[1]).is_err());
        // Unknown numbers pass.
        assert!(validate(0x7a10, &[0u8; 64]).is_ok());
    }

    #[test]
    fn test_uint_codec() {
        assert_eq!(encode_uint(0).as_ref(), b"");
        assert_eq!(encode_uint(0x10).as_ref(), &[0x10]);
        assert_eq!(encode_uint(0x0300).as_ref(), &[0x03, 0x00]);
        assert_eq!(encode_uint(0xff_ffff).as_ref(), &[0xff, 0xff, 0xff]);
        for value in [0u32, 1, 255, 256, 65535, 1 << 20, u32::MAX] {
            assert_eq!(decode_uint(&encode_uint(value)), Some(value));
        }
        assert_eq!(decode_uint(&[1, 2, 3, 4, 5]), None);
    }
}
