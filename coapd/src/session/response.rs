//! Handler-facing response builder.

use bytes::Bytes;
use coapd_msg::{Code, ContentFormat, Message};

/// Accumulates the response a request handler wants to send.
///
/// When the handler returns, the session driver turns the writer's
/// contents into a piggybacked ACK (for a confirmable request) or a NON
/// response, runs it through the block-wise engine and ships it. A
/// handler that never calls [`ResponseWriter::set_response`] produces an
/// empty ACK only.
pub struct ResponseWriter {
    code: Option<Code>,
    content_format: Option<ContentFormat>,
    payload: Bytes,
    options: Vec<(u16, Bytes)>,
}

impl ResponseWriter {
    pub(crate) fn new() -> Self {
        Self {
            code: None,
            content_format: None,
            payload: Bytes::new(),
            options: Vec::new(),
        }
    }

    /// Set the response code, content format and payload.
    pub fn set_response(&mut self, code: Code, content_format: ContentFormat, payload: impl Into<Bytes>) {
        self.code = Some(code);
        self.content_format = Some(content_format);
        self.payload = payload.into();
    }

    /// Append an arbitrary option to the response.
    pub fn add_option(&mut self, number: u16, value: Bytes) {
        self.options.push((number, value));
    }

    /// Whether the handler produced a response at all.
    pub(crate) fn has_response(&self) -> bool {
        self.code.is_some()
    }

    /// Fill `msg` (a prepared reply shell) from the writer's contents.
    pub(crate) fn apply_to(self, msg: &mut Message) {
        if let Some(code) = self.code {
            msg.code = code;
        }
        if let Some(format) = self.content_format {
            msg.set_content_format(format);
        }
        for (number, value) in self.options {
            msg.add_option(number, value);
        }
        msg.payload = self.payload;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coapd_msg::{option, MessageType, Token};

    #[test]
    fn test_apply_fills_shell() {
        let mut writer = ResponseWriter::new();
        writer.set_response(Code::CONTENT, ContentFormat::TEXT_PLAIN, &b"22.3 C"[..]);
        writer.add_option(option::MAX_AGE, option::encode_uint(60));

        let mut msg = Message::ack_with(7, Token::new(&[1]).unwrap(), Code::EMPTY);
        assert!(writer.has_response());
        writer.apply_to(&mut msg);

        assert_eq!(msg.ty, MessageType::Acknowledgement);
        assert_eq!(msg.code, Code::CONTENT);
        assert_eq!(msg.content_format(), Some(ContentFormat::TEXT_PLAIN));
        assert_eq!(msg.payload.as_ref(), b"22.3 C");
        assert_eq!(option::decode_uint(msg.option(option::MAX_AGE).unwrap()), Some(60));
    }

    #[test]
    fn test_untouched_writer_has_no_response() {
        assert!(!ResponseWriter::new().has_response());
    }
}
