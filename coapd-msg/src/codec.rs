//! # Wire Codec (RFC 7252 Section 3)
//!
//! Serialization and zero-copy parsing of CoAP-over-UDP datagrams:
//!
//! ```text
//! byte 0:  VV TT TKL TKL TKL TKL   (VV=01, TT=type, TKL=0..8)
//! byte 1:  CODE (class << 5 | detail)
//! bytes 2-3: MESSAGE_ID (big-endian)
//! bytes 4..4+TKL-1: TOKEN
//! then options in delta/length TLV form
//! then 0xFF marker followed by PAYLOAD (if any)
//! ```
//!
//! Each option is `DELTA_NIBBLE LENGTH_NIBBLE [ext delta] [ext length]
//! VALUE`. Nibble values 0..12 mean themselves, 13 adds one extension
//! byte (value minus 13), 14 adds a big-endian two-byte extension (value
//! minus 269), and 15 is reserved.

use bytes::Bytes;

use crate::error::{DecodeError, EncodeError};
use crate::message::{CoapOption, Message};
use crate::types::{MessageType, Token, MAX_TOKEN_LENGTH, VERSION};

/// Default cap applied by [`decode`]; the UDP payload can never exceed it.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65535;

/// Largest value representable by a nibble with a two-byte extension.
const MAX_EXTENDED: usize = 269 + 65535;

/// How a nibble value is extended past 12.
enum NibbleExt {
    None(u8),
    Ext8(u8, u8),
    Ext16(u8, u16),
}

fn nibble_for(value: usize) -> NibbleExt {
    if value < 13 {
        NibbleExt::None(value as u8)
    } else if value < 269 {
        NibbleExt::Ext8(13, (value - 13) as u8)
    } else {
        NibbleExt::Ext16(14, (value - 269) as u16)
    }
}

fn nibble_size(value: usize) -> usize {
    match nibble_for(value) {
        NibbleExt::None(_) => 0,
        NibbleExt::Ext8(..) => 1,
        NibbleExt::Ext16(..) => 2,
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize a message into a caller-provided buffer, returning the
/// number of bytes written.
///
/// Options are emitted in ascending number order; equal-numbered options
/// keep their relative order from the message (stable sort). The whole
/// message is sized up front, so a [`EncodeError::BufferTooSmall`] failure
/// reports the exact length required and leaves the buffer contents
/// unspecified.
pub fn encode(msg: &Message, buf: &mut [u8]) -> Result<usize, EncodeError> {
    if msg.token.len() > MAX_TOKEN_LENGTH {
        return Err(EncodeError::InvalidToken(msg.token.len()));
    }

    // The message keeps options ordered, but the encoder does not rely on
    // that: it sorts a scratch index list stably by number.
    let mut order: Vec<usize> = (0..msg.options().len()).collect();
    order.sort_by_key(|&idx| msg.options()[idx].number);

    let mut needed = 4 + msg.token.len();
    let mut prev_number = 0u16;
    for &idx in &order {
        let opt = &msg.options()[idx];
        crate::option::validate(opt.number, &opt.value)?;
        if opt.value.len() > MAX_EXTENDED {
            return Err(EncodeError::InvalidOption {
                number: opt.number,
                len: opt.value.len(),
                min: 0,
                max: MAX_EXTENDED,
            });
        }
        let delta = (opt.number - prev_number) as usize;
        needed += 1 + nibble_size(delta) + nibble_size(opt.value.len()) + opt.value.len();
        prev_number = opt.number;
    }
    if !msg.payload.is_empty() {
        needed += 1 + msg.payload.len();
    }

    if buf.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            capacity: buf.len(),
            needed,
        });
    }

    buf[0] = VERSION << 6 | msg.ty.to_wire() << 4 | msg.token.len() as u8;
    buf[1] = msg.code.to_wire();
    buf[2..4].copy_from_slice(&msg.message_id.to_be_bytes());
    let mut at = 4;
    buf[at..at + msg.token.len()].copy_from_slice(msg.token.as_bytes());
    at += msg.token.len();

    let mut prev_number = 0u16;
    for &idx in &order {
        let opt = &msg.options()[idx];
        let delta = nibble_for((opt.number - prev_number) as usize);
        let length = nibble_for(opt.value.len());
        let (delta_nibble, len_nibble) = (nibble_value(&delta), nibble_value(&length));
        buf[at] = delta_nibble << 4 | len_nibble;
        at += 1;
        at += write_ext(&delta, &mut buf[at..]);
        at += write_ext(&length, &mut buf[at..]);
        buf[at..at + opt.value.len()].copy_from_slice(&opt.value);
        at += opt.value.len();
        prev_number = opt.number;
    }

    if !msg.payload.is_empty() {
        buf[at] = 0xff;
        at += 1;
        buf[at..at + msg.payload.len()].copy_from_slice(&msg.payload);
        at += msg.payload.len();
    }

    debug_assert_eq!(at, needed);
    Ok(at)
}

fn nibble_value(ext: &NibbleExt) -> u8 {
    match ext {
        NibbleExt::None(nibble) | NibbleExt::Ext8(nibble, _) | NibbleExt::Ext16(nibble, _) => {
            *nibble
        }
    }
}

fn write_ext(ext: &NibbleExt, buf: &mut [u8]) -> usize {
    match ext {
        NibbleExt::None(_) => 0,
        NibbleExt::Ext8(_, byte) => {
            buf[0] = *byte;
            1
        }
        NibbleExt::Ext16(_, word) => {
            buf[..2].copy_from_slice(&word.to_be_bytes());
            2
        }
    }
}

/// Serialize into a freshly allocated, exactly sized buffer.
pub fn encode_to_bytes(msg: &Message) -> Result<Bytes, EncodeError> {
    let mut buf = vec![0u8; DEFAULT_MAX_MESSAGE_SIZE.min(encoded_size_upper_bound(msg))];
    let len = encode(msg, &mut buf)?;
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

fn encoded_size_upper_bound(msg: &Message) -> usize {
    let opts: usize = msg
        .options()
        .iter()
        .map(|opt| 5 + opt.value.len())
        .sum();
    4 + MAX_TOKEN_LENGTH + opts + 1 + msg.payload.len()
}

// ============================================================================
// Decoding
// ============================================================================

/// Parse one datagram with the default 64 KB size cap.
pub fn decode(data: Bytes) -> Result<Message, DecodeError> {
    decode_bounded(data, DEFAULT_MAX_MESSAGE_SIZE)
}

/// Parse one datagram, rejecting inputs longer than `limit`.
///
/// Option values and the payload of the returned message are zero-copy
/// slices of `data`; only one pre-sized option container is allocated.
pub fn decode_bounded(data: Bytes, limit: usize) -> Result<Message, DecodeError> {
    if data.len() > limit {
        return Err(DecodeError::MessageTooLarge {
            len: data.len(),
            limit,
        });
    }
    if data.len() < 4 {
        return Err(DecodeError::Truncated);
    }

    let version = data[0] >> 6;
    if version != VERSION {
        return Err(DecodeError::InvalidVersion(version));
    }
    let ty = MessageType::from_wire(data[0] >> 4);
    let tkl = data[0] & 0x0f;
    if tkl as usize > MAX_TOKEN_LENGTH {
        return Err(DecodeError::InvalidToken(tkl));
    }
    let code = crate::code::Code::from_wire(data[1]);
    let message_id = u16::from_be_bytes([data[2], data[3]]);

    let mut at = 4usize;
    if data.len() < at + tkl as usize {
        return Err(DecodeError::Truncated);
    }
    let token = Token::new(&data[at..at + tkl as usize]).expect("tkl bounded above");
    at += tkl as usize;

    let mut options: Vec<CoapOption> = Vec::with_capacity(16);
    let mut number = 0u32;
    let mut payload = Bytes::new();

    while at < data.len() {
        if data[at] == 0xff {
            at += 1;
            if at == data.len() {
                return Err(DecodeError::MissingPayload);
            }
            payload = data.slice(at..);
            break;
        }

        let delta_nibble = data[at] >> 4;
        let len_nibble = data[at] & 0x0f;
        if delta_nibble == 15 || len_nibble == 15 {
            return Err(DecodeError::ReservedNibble);
        }
        at += 1;

        let delta = read_ext(&data, &mut at, delta_nibble)?;
        let length = read_ext(&data, &mut at, len_nibble)?;

        number += delta as u32;
        if number > u16::MAX as u32 {
            return Err(DecodeError::OptionOverflow);
        }
        if data.len() < at + length {
            return Err(DecodeError::Truncated);
        }
        options.push(CoapOption {
            number: number as u16,
            value: data.slice(at..at + length),
        });
        at += length;
    }

    Ok(Message::with_options(
        ty, code, message_id, token, options, payload,
    ))
}

fn read_ext(data: &Bytes, at: &mut usize, nibble: u8) -> Result<usize, DecodeError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            if data.len() < *at + 1 {
                return Err(DecodeError::Truncated);
            }
            let value = 13 + data[*at] as usize;
            *at += 1;
            Ok(value)
        }
        14 => {
            if data.len() < *at + 2 {
                return Err(DecodeError::Truncated);
            }
            let value = 269 + u16::from_be_bytes([data[*at], data[*at + 1]]) as usize;
            *at += 2;
            Ok(value)
        }
        _ => Err(DecodeError::ReservedNibble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Code;
    use crate::option;

    fn roundtrip(msg: &Message) -> Message {
        let mut buf = vec![0u8; 70 * 1024];
        let len = encode(msg, &mut buf).expect("encode");
        decode_bounded(Bytes::copy_from_slice(&buf[..len]), usize::MAX).expect("decode")
    }

    #[test]
    fn test_empty_get() {
        let msg = Message::new(MessageType::Confirmable, Code::GET, 0);
        let mut buf = [0u8; 16];
        let len = encode(&msg, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x40, 0x01, 0x00, 0x00]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_get_with_token_and_payload() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0);
        msg.token = Token::new(&[0x01, 0x02, 0x03]).unwrap();
        msg.payload = Bytes::from_static(&[0x01]);
        let mut buf = [0u8; 16];
        let len = encode(&msg, &mut buf).unwrap();
        assert_eq!(
            &buf[..len],
            &[0x43, 0x01, 0x00, 0x00, 0x01, 0x02, 0x03, 0xff, 0x01]
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_get_with_path_and_content_format() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0);
        msg.token = Token::new(&[0x01, 0x02, 0x03]).unwrap();
        msg.set_path("/a/b/c/d/e");
        msg.set_content_format(crate::types::ContentFormat::TEXT_PLAIN);
        msg.payload = Bytes::from_static(&[0x01]);

        let mut buf = [0u8; 64];
        let len = encode(&msg, &mut buf).unwrap();
        assert_eq!(
            &buf[..len],
            &[
                0x43, 0x01, 0x00, 0x00, 0x01, 0x02, 0x03, 0xb1, 0x61, 0x01, 0x62, 0x01, 0x63,
                0x01, 0x64, 0x01, 0x65, 0x10, 0xff, 0x01
            ]
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_token_length_boundaries() {
        for len in [0usize, 8] {
            let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0xbeef);
            msg.token = Token::new(&vec![0xaa; len]).unwrap();
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn test_option_length_nibble_extensions() {
        // 12 fits the nibble, 13 and 268 take the one-byte extension,
        // 269 and 65804 take the two-byte extension.
        for len in [12usize, 13, 268, 269, MAX_EXTENDED] {
            let mut msg = Message::new(MessageType::Confirmable, Code::GET, 1);
            // Unknown elective number: no registry length bounds apply.
            msg.add_option(0x100a, Bytes::from(vec![0x5a; len]));
            let decoded = roundtrip(&msg);
            assert_eq!(decoded.option(0x100a).unwrap().len(), len);
        }
    }

    #[test]
    fn test_option_delta_extensions() {
        // Deltas of 12, 13..268 and 269.. exercise all nibble forms.
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 1);
        for number in [12u16, 268, 60000] {
            msg.add_option(number, Bytes::from_static(b"v"));
        }
        let decoded = roundtrip(&msg);
        let numbers: Vec<u16> = decoded.options().iter().map(|opt| opt.number).collect();
        assert_eq!(numbers, vec![12, 268, 60000]);
    }

    #[test]
    fn test_encoder_sorts_stably() {
        // with_options bypasses the ordered insert; the encoder must sort.
        let options = vec![
            CoapOption {
                number: option::CONTENT_FORMAT,
                value: Bytes::new(),
            },
            CoapOption {
                number: option::URI_PATH,
                value: Bytes::from_static(b"first"),
            },
            CoapOption {
                number: option::URI_PATH,
                value: Bytes::from_static(b"second"),
            },
        ];
        let msg = Message::with_options(
            MessageType::Confirmable,
            Code::GET,
            2,
            Token::empty(),
            options,
            Bytes::new(),
        );
        let decoded = roundtrip(&msg);
        let numbers: Vec<u16> = decoded.options().iter().map(|opt| opt.number).collect();
        assert_eq!(
            numbers,
            vec![option::URI_PATH, option::URI_PATH, option::CONTENT_FORMAT]
        );
        let segments: Vec<&Bytes> = decoded.option_values(option::URI_PATH).collect();
        assert_eq!(segments[0].as_ref(), b"first");
        assert_eq!(segments[1].as_ref(), b"second");
    }

    #[test]
    fn test_decode_truncated() {
        for data in [
            &[][..],
            &[0x40, 0x01, 0x00][..],
            // Declares a 3-byte token, supplies 2.
            &[0x43, 0x01, 0x00, 0x00, 0x01, 0x02][..],
            // Option declares 2-byte value, supplies 1.
            &[0x40, 0x01, 0x00, 0x00, 0xb2, 0x61][..],
            // One-byte delta extension missing.
            &[0x40, 0x01, 0x00, 0x00, 0xd0][..],
        ] {
            assert_eq!(
                decode(Bytes::copy_from_slice(data)),
                Err(DecodeError::Truncated),
                "input {:02x?}",
                data
            );
        }
    }

    #[test]
    fn test_decode_reserved_nibble() {
        // Delta nibble 15 on a byte that is not the 0xFF marker.
        let data = [0x40, 0x01, 0x00, 0x00, 0xf1, 0x00];
        assert_eq!(
            decode(Bytes::copy_from_slice(&data)),
            Err(DecodeError::ReservedNibble)
        );
        // Length nibble 15.
        let data = [0x40, 0x01, 0x00, 0x00, 0x1f];
        assert_eq!(
            decode(Bytes::copy_from_slice(&data)),
            Err(DecodeError::ReservedNibble)
        );
    }

    #[test]
    fn test_decode_option_overflow() {
        // A two-byte-extension delta of 269 + 0xff00 = 65549 overflows u16.
        let data = [0x40, 0x01, 0x00, 0x00, 0xe0, 0xff, 0x00];
        assert_eq!(
            decode(Bytes::copy_from_slice(&data)),
            Err(DecodeError::OptionOverflow)
        );
    }

    #[test]
    fn test_decode_marker_without_payload() {
        let data = [0x40, 0x01, 0x00, 0x00, 0xff];
        assert_eq!(
            decode(Bytes::copy_from_slice(&data)),
            Err(DecodeError::MissingPayload)
        );
    }

    #[test]
    fn test_decode_bad_version() {
        let data = [0x80, 0x01, 0x00, 0x00];
        assert_eq!(
            decode(Bytes::copy_from_slice(&data)),
            Err(DecodeError::InvalidVersion(2))
        );
    }

    #[test]
    fn test_decode_bad_token_length() {
        let data = [0x49, 0x01, 0x00, 0x00];
        assert_eq!(
            decode(Bytes::copy_from_slice(&data)),
            Err(DecodeError::InvalidToken(9))
        );
    }

    #[test]
    fn test_decode_size_limit() {
        let data = vec![0u8; 128];
        assert_eq!(
            decode_bounded(Bytes::from(data), 64),
            Err(DecodeError::MessageTooLarge {
                len: 128,
                limit: 64
            })
        );
    }

    #[test]
    fn test_decode_is_zero_copy() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 3);
        msg.set_path("/zero/copy");
        msg.payload = Bytes::from_static(b"body");
        let wire = encode_to_bytes(&msg).unwrap();
        let decoded = decode(wire.clone()).unwrap();
        // Slices of the input share its allocation: the payload starts
        // inside the wire buffer's address range.
        let wire_range = wire.as_ptr() as usize..wire.as_ptr() as usize + wire.len();
        assert!(wire_range.contains(&(decoded.payload.as_ptr() as usize)));
    }

    #[test]
    fn test_buffer_too_small_reports_needed() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0);
        msg.payload = Bytes::from_static(b"0123456789");
        let mut buf = [0u8; 8];
        assert_eq!(
            encode(&msg, &mut buf),
            Err(EncodeError::BufferTooSmall {
                capacity: 8,
                needed: 15
            })
        );
    }

    #[test]
    fn test_encode_rejects_invalid_option_length() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0);
        // ETag is bounded to 8 bytes.
        msg.add_option(option::ETAG, Bytes::from(vec![0u8; 9]));
        let mut buf = [0u8; 32];
        assert!(matches!(
            encode(&msg, &mut buf),
            Err(EncodeError::InvalidOption { number, len: 9, .. }) if number == option::ETAG
        ));
    }
}
