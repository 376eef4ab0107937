//! # The CoAP Message Model (RFC 7252 Section 3)
//!
//! One protocol data unit: header fields, token, ordered options and
//! payload. Options are held in ascending number order at all times;
//! repeatable options with equal numbers keep their insertion order, which
//! the codec relies on for deterministic serialization.

use bytes::Bytes;

use crate::block::{BlockError, BlockValue};
use crate::code::Code;
use crate::option;
use crate::types::{MessageId, MessageType, Token};

/// One option instance: a registry number and its raw value.
///
/// Values decoded from a datagram are zero-copy slices of the input
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Bytes,
}

/// One CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub ty: MessageType,
    pub code: Code,
    pub message_id: MessageId,
    pub token: Token,
    options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl Message {
    /// Create a message with no token, options or payload.
    pub fn new(ty: MessageType, code: Code, message_id: MessageId) -> Self {
        Self {
            ty,
            code,
            message_id,
            token: Token::empty(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// An empty ACK silencing retransmission of `message_id`.
    pub fn ack(message_id: MessageId) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    /// A piggybacked response: ACK carrying a response code and the
    /// request token.
    pub fn ack_with(message_id: MessageId, token: Token, code: Code) -> Self {
        let mut msg = Self::new(MessageType::Acknowledgement, code, message_id);
        msg.token = token;
        msg
    }

    /// An RST rejecting `message_id`.
    pub fn reset(message_id: MessageId) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    /// The options in ascending number order.
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Append an option, preserving ascending order; an equal-numbered
    /// option lands after existing instances of that number.
    pub fn add_option(&mut self, number: u16, value: Bytes) {
        let idx = self.options.partition_point(|opt| opt.number <= number);
        self.options.insert(idx, CoapOption { number, value });
    }

    /// Replace all instances of an option number with a single value.
    pub fn set_option(&mut self, number: u16, value: Bytes) {
        self.remove_option(number);
        self.add_option(number, value);
    }

    /// Remove all instances of an option number.
    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|opt| opt.number != number);
    }

    /// First value of an option number, if present.
    pub fn option(&self, number: u16) -> Option<&Bytes> {
        self.options
            .iter()
            .find(|opt| opt.number == number)
            .map(|opt| &opt.value)
    }

    /// All values of a (repeatable) option number, in order.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &Bytes> {
        self.options
            .iter()
            .filter(move |opt| opt.number == number)
            .map(|opt| &opt.value)
    }

    /// Whether any instance of an option number is present.
    pub fn has_option(&self, number: u16) -> bool {
        self.options.iter().any(|opt| opt.number == number)
    }

    /// Set the request path as repeated Uri-Path segments. Empty segments
    /// are skipped, so `/a//b` and `a/b` produce the same options.
    pub fn set_path(&mut self, path: &str) {
        self.remove_option(option::URI_PATH);
        for segment in path.split('/').filter(|seg| !seg.is_empty()) {
            self.add_option(option::URI_PATH, Bytes::copy_from_slice(segment.as_bytes()));
        }
    }

    /// Reassemble the request path from Uri-Path segments.
    pub fn path(&self) -> String {
        let mut out = String::new();
        for value in self.option_values(option::URI_PATH) {
            out.push('/');
            out.push_str(&String::from_utf8_lossy(value));
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Append one Uri-Query argument.
    pub fn add_query(&mut self, query: &str) {
        self.add_option(option::URI_QUERY, Bytes::copy_from_slice(query.as_bytes()));
    }

    /// Set the Content-Format option.
    pub fn set_content_format(&mut self, format: crate::types::ContentFormat) {
        self.set_option(option::CONTENT_FORMAT, option::encode_uint(format.0 as u32));
    }

    /// The Content-Format option, if present and well-formed.
    pub fn content_format(&self) -> Option<crate::types::ContentFormat> {
        let value = self.option(option::CONTENT_FORMAT)?;
        option::decode_uint(value).map(|raw| crate::types::ContentFormat(raw as u16))
    }

    /// The Observe option value, if present and well-formed (24-bit
    /// notification sequence number, RFC 7641 Section 2).
    pub fn observe(&self) -> Option<u32> {
        let value = self.option(option::OBSERVE)?;
        if value.len() > 3 {
            return None;
        }
        option::decode_uint(value)
    }

    /// Set the Observe option.
    pub fn set_observe(&mut self, value: u32) {
        self.set_option(option::OBSERVE, option::encode_uint(value & 0x00ff_ffff));
    }

    /// Parse a Block1/Block2 option if present.
    pub fn block(&self, number: u16) -> Result<Option<BlockValue>, BlockError> {
        match self.option(number) {
            None => Ok(None),
            Some(value) => BlockValue::from_option_value(value).map(Some),
        }
    }

    /// Set a Block1/Block2 option.
    pub fn set_block(&mut self, number: u16, block: BlockValue) {
        self.set_option(number, block.to_option_value());
    }

    /// Option numbers of unrecognised critical options, used to reject
    /// requests with 4.02 Bad Option (RFC 7252 Section 5.4.1).
    pub fn unknown_critical_options(&self) -> Vec<u16> {
        let mut numbers: Vec<u16> = self
            .options
            .iter()
            .map(|opt| opt.number)
            .filter(|&num| option::is_critical(num) && !option::is_known(num))
            .collect();
        numbers.dedup();
        numbers
    }

    /// Clear all fields for reuse from a pool, keeping the allocated
    /// option container.
    pub fn reset_for_reuse(&mut self) {
        self.ty = MessageType::Confirmable;
        self.code = Code::EMPTY;
        self.message_id = 0;
        self.token = Token::empty();
        self.options.clear();
        self.payload = Bytes::new();
    }

    pub(crate) fn with_options(
        ty: MessageType,
        code: Code,
        message_id: MessageId,
        token: Token,
        options: Vec<CoapOption>,
        payload: Bytes,
    ) -> Self {
        Self {
            ty,
            code,
            message_id,
            token,
            options,
            payload,
        }
    }
}
