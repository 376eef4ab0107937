//! Block-wise transfer engine (RFC 7959).
//!
//! Splits oversize payloads into numbered blocks and reassembles them,
//! keyed by request fingerprint. The engine is a passive state machine
//! serving the receiving side: the session feeds it inbound requests and
//! outbound responses and sends whatever protocol replies it produces.
//! The sending side (Block1 upload and Block2 download loops) lives in
//! the session's request path.
//!
//! Progress tracking is by byte offset rather than block number, which
//! makes a mid-transfer block-size reduction (lower SZX wins) fall out
//! naturally: an offset is a multiple of every smaller block size.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

use bytes::{Bytes, BytesMut};
use coapd_msg::block::BlockValue;
use coapd_msg::{option, Code, Message, MessageId, MessageType, Szx, Token};

/// Identity of one logical exchange: remote endpoint, token, method and
/// every cache-keyed option (NoCacheKey options such as Block1/Block2 are
/// excluded, so all datagrams of one transfer share a fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    peer: SocketAddr,
    token: Token,
    code: Code,
    cache_key: Vec<(u16, Bytes)>,
}

impl Fingerprint {
    pub fn of(peer: SocketAddr, msg: &Message) -> Self {
        let cache_key = msg
            .options()
            .iter()
            .filter(|opt| !option::is_no_cache_key(opt.number))
            .map(|opt| (opt.number, opt.value.clone()))
            .collect();
        Self {
            peer,
            token: msg.token,
            code: msg.code,
            cache_key,
        }
    }
}

/// What the session should do with an inbound request.
#[derive(Debug)]
pub enum RequestDisposition {
    /// The request is complete (possibly just reassembled); dispatch it to
    /// the user handler.
    Deliver(Message),
    /// A protocol reply (2.31 Continue, a cached Block2 slice, 4.08 or
    /// 4.13); send it without invoking the handler.
    Reply(Message),
}

#[derive(Debug)]
struct Assembly {
    buffer: BytesMut,
    deadline: Instant,
}

#[derive(Debug)]
struct CachedResponse {
    /// Full response, payload unsliced, without a Block2 option.
    response: Message,
    deadline: Instant,
}

/// Per-session block-wise engine.
pub struct BlockwiseEngine {
    enabled: bool,
    preferred_szx: Szx,
    transfer_timeout: Duration,
    /// Assembly-buffer cap; exceeding it aborts the transfer with 4.13.
    max_payload: usize,
    assemblies: HashMap<Fingerprint, Assembly>,
    responses: HashMap<Fingerprint, CachedResponse>,
}

impl BlockwiseEngine {
    pub fn new(
        enabled: bool,
        preferred_szx: Szx,
        transfer_timeout: Duration,
        max_payload: usize,
    ) -> Self {
        Self {
            enabled,
            preferred_szx,
            transfer_timeout,
            max_payload,
            assemblies: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    pub fn preferred_szx(&self) -> Szx {
        self.preferred_szx
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Route an inbound request through the engine.
    ///
    /// `reply_mid` is used for replies to non-confirmable requests;
    /// replies to confirmables are piggybacked on the ACK.
    pub fn on_request(
        &mut self,
        peer: SocketAddr,
        msg: Message,
        reply_mid: MessageId,
        now: Instant,
    ) -> RequestDisposition {
        self.sweep(now);
        if !self.enabled {
            return RequestDisposition::Deliver(msg);
        }

        let block1 = match msg.block(option::BLOCK1) {
            Ok(block) => block,
            Err(_) => {
                return RequestDisposition::Reply(reply_shell(&msg, Code::BAD_OPTION, reply_mid))
            }
        };
        if let Some(block) = block1 {
            return self.on_block1_request(peer, msg, block, reply_mid, now);
        }

        let block2 = match msg.block(option::BLOCK2) {
            Ok(block) => block,
            Err(_) => {
                return RequestDisposition::Reply(reply_shell(&msg, Code::BAD_OPTION, reply_mid))
            }
        };
        if let Some(block) = block2 {
            if block.num > 0 {
                return self.on_block2_continuation(peer, msg, block, reply_mid, now);
            }
        }

        RequestDisposition::Deliver(msg)
    }

    fn on_block1_request(
        &mut self,
        peer: SocketAddr,
        msg: Message,
        block: BlockValue,
        reply_mid: MessageId,
        now: Instant,
    ) -> RequestDisposition {
        let fingerprint = Fingerprint::of(peer, &msg);

        if block.num == 0 {
            // First block restarts any half-finished transfer under the
            // same fingerprint.
            self.assemblies.insert(
                fingerprint.clone(),
                Assembly {
                    buffer: BytesMut::new(),
                    deadline: now + self.transfer_timeout,
                },
            );
        }

        let Some(assembly) = self.assemblies.get_mut(&fingerprint) else {
            return RequestDisposition::Reply(reply_shell(
                &msg,
                Code::REQUEST_ENTITY_INCOMPLETE,
                reply_mid,
            ));
        };

        if block.offset() != assembly.buffer.len() {
            self.assemblies.remove(&fingerprint);
            return RequestDisposition::Reply(reply_shell(
                &msg,
                Code::REQUEST_ENTITY_INCOMPLETE,
                reply_mid,
            ));
        }

        assembly.buffer.extend_from_slice(&msg.payload);
        assembly.deadline = now + self.transfer_timeout;

        if assembly.buffer.len() > self.max_payload {
            self.assemblies.remove(&fingerprint);
            return RequestDisposition::Reply(reply_shell(
                &msg,
                Code::REQUEST_ENTITY_TOO_LARGE,
                reply_mid,
            ));
        }

        if block.more {
            // Lower SZX wins: a peer offering larger blocks than we are
            // configured for is told to shrink.
            let szx = block.szx.min(self.preferred_szx);
            let mut reply = reply_shell(&msg, Code::CONTINUE, reply_mid);
            reply.set_block(
                option::BLOCK1,
                BlockValue::new(block.num, true, szx).expect("echoed block number is valid"),
            );
            return RequestDisposition::Reply(reply);
        }

        let assembly = self
            .assemblies
            .remove(&fingerprint)
            .expect("assembly checked above");
        let mut complete = msg;
        complete.remove_option(option::BLOCK1);
        complete.remove_option(option::SIZE1);
        complete.payload = assembly.buffer.freeze();
        RequestDisposition::Deliver(complete)
    }

    fn on_block2_continuation(
        &mut self,
        peer: SocketAddr,
        msg: Message,
        block: BlockValue,
        reply_mid: MessageId,
        now: Instant,
    ) -> RequestDisposition {
        let fingerprint = Fingerprint::of(peer, &msg);
        match self.responses.get_mut(&fingerprint) {
            Some(cached) => {
                cached.deadline = now + self.transfer_timeout;
                let response = cached.response.clone();
                RequestDisposition::Reply(slice_block2(&msg, &response, block, reply_mid))
            }
            // Cache gone (expired or never made): re-deliver to the
            // handler, which must produce stable content; on_response
            // slices the regenerated payload at the requested number.
            None => RequestDisposition::Deliver(msg),
        }
    }

    /// Post-process an outbound response for the given request. Oversize
    /// payloads are cached by fingerprint and the requested slice is
    /// returned in their place.
    pub fn on_response(
        &mut self,
        peer: SocketAddr,
        request: &Message,
        response: Message,
        now: Instant,
    ) -> Message {
        if !self.enabled || response.payload.is_empty() {
            return response;
        }

        let requested = request.block(option::BLOCK2).ok().flatten();
        let szx = requested
            .map(|block| block.szx.min(self.preferred_szx))
            .unwrap_or(self.preferred_szx);

        if response.payload.len() <= szx.size() && requested.map_or(true, |block| block.num == 0) {
            return response;
        }

        let fingerprint = Fingerprint::of(peer, request);
        self.responses.insert(
            fingerprint,
            CachedResponse {
                response: response.clone(),
                deadline: now + self.transfer_timeout,
            },
        );

        let block = BlockValue::new(requested.map_or(0, |b| b.num), false, szx)
            .expect("requested block number was already decoded");
        let mut shell = Message::new(response.ty, response.code, response.message_id);
        shell.token = response.token;
        slice_block2_into(&response, block, shell)
    }

    /// Drop transfers and cached responses with no recent progress.
    pub fn sweep(&mut self, now: Instant) {
        self.assemblies.retain(|_, assembly| assembly.deadline > now);
        self.responses.retain(|_, cached| cached.deadline > now);
    }

    /// Discard all state (session shutdown).
    pub fn clear(&mut self) {
        self.assemblies.clear();
        self.responses.clear();
    }

    pub fn active_transfers(&self) -> usize {
        self.assemblies.len()
    }

    pub fn cached_responses(&self) -> usize {
        self.responses.len()
    }
}

/// Build the reply skeleton matching the request's reliability mode:
/// piggybacked ACK for a confirmable, NON with a fresh message ID
/// otherwise.
fn reply_shell(request: &Message, code: Code, reply_mid: MessageId) -> Message {
    match request.ty {
        MessageType::Confirmable => Message::ack_with(request.message_id, request.token, code),
        _ => {
            let mut msg = Message::new(MessageType::NonConfirmable, code, reply_mid);
            msg.token = request.token;
            msg
        }
    }
}

/// Produce the Block2 slice of a cached response for a continuation
/// request.
fn slice_block2(
    request: &Message,
    cached: &Message,
    block: BlockValue,
    reply_mid: MessageId,
) -> Message {
    let shell = reply_shell(request, cached.code, reply_mid);
    slice_block2_into(cached, block, shell)
}

fn slice_block2_into(full: &Message, block: BlockValue, mut out: Message) -> Message {
    let size = block.szx.size();
    let offset = block.offset();
    if offset >= full.payload.len() {
        // Block number past the end of the representation.
        out.code = Code::BAD_OPTION;
        out.payload = Bytes::new();
        return out;
    }
    let end = (offset + size).min(full.payload.len());
    let more = end < full.payload.len();

    out.code = full.code;
    for opt in full.options() {
        out.add_option(opt.number, opt.value.clone());
    }
    out.remove_option(option::BLOCK2);
    out.set_block(
        option::BLOCK2,
        BlockValue::new(block.num, more, block.szx).expect("validated block number"),
    );
    if block.num == 0 {
        out.set_option(option::SIZE2, option::encode_uint(full.payload.len() as u32));
    }
    out.payload = full.payload.slice(offset..end);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.1:5683".parse().unwrap()
    }

    fn engine() -> BlockwiseEngine {
        BlockwiseEngine::new(true, Szx::S1024, Duration::from_secs(5), 65535)
    }

    fn upload_block(num: u32, more: bool, chunk: &[u8], mid: MessageId) -> Message {
        let mut msg = Message::new(MessageType::Confirmable, Code::PUT, mid);
        msg.token = Token::new(&[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
        msg.set_path("/fw");
        msg.set_block(
            option::BLOCK1,
            BlockValue::new(num, more, Szx::S1024).unwrap(),
        );
        msg.payload = Bytes::copy_from_slice(chunk);
        msg
    }

    #[test]
    fn test_block1_upload_reassembles() {
        let mut engine = engine();
        let now = Instant::now();
        let body: Vec<u8> = (0..2560u32).map(|i| i as u8).collect();

        // Blocks (0,1,6) and (1,1,6) get 2.31 Continue echoing num and szx.
        for (num, chunk) in [(0u32, &body[..1024]), (1, &body[1024..2048])] {
            let disposition =
                engine.on_request(peer(), upload_block(num, true, chunk, num as u16), 0, now);
            match disposition {
                RequestDisposition::Reply(reply) => {
                    assert_eq!(reply.code, Code::CONTINUE);
                    assert_eq!(reply.ty, MessageType::Acknowledgement);
                    assert_eq!(reply.message_id, num as u16);
                    let echo = reply.block(option::BLOCK1).unwrap().unwrap();
                    assert_eq!((echo.num, echo.more, echo.szx), (num, true, Szx::S1024));
                }
                other => panic!("expected continue, got {:?}", other),
            }
        }

        // Final block (2,0,6) delivers the assembled 2560-byte request.
        let disposition = engine.on_request(peer(), upload_block(2, false, &body[2048..], 2), 0, now);
        match disposition {
            RequestDisposition::Deliver(msg) => {
                assert_eq!(msg.payload.len(), 2560);
                assert_eq!(msg.payload.as_ref(), &body[..]);
                assert!(msg.option(option::BLOCK1).is_none());
            }
            other => panic!("expected delivery, got {:?}", other),
        }
        assert_eq!(engine.active_transfers(), 0);
    }

    #[test]
    fn test_block1_gap_yields_incomplete() {
        let mut engine = engine();
        let now = Instant::now();
        engine.on_request(peer(), upload_block(0, true, &[0u8; 1024], 0), 0, now);
        // Block 2 without block 1.
        let disposition = engine.on_request(peer(), upload_block(2, true, &[0u8; 1024], 1), 0, now);
        match disposition {
            RequestDisposition::Reply(reply) => {
                assert_eq!(reply.code, Code::REQUEST_ENTITY_INCOMPLETE)
            }
            other => panic!("expected 4.08, got {:?}", other),
        }
        // State was dropped; resuming mid-transfer also fails.
        let disposition = engine.on_request(peer(), upload_block(1, true, &[0u8; 1024], 2), 0, now);
        assert!(matches!(
            disposition,
            RequestDisposition::Reply(reply) if reply.code == Code::REQUEST_ENTITY_INCOMPLETE
        ));
    }

    #[test]
    fn test_block1_middle_block_without_start() {
        let mut engine = engine();
        let disposition = engine.on_request(
            peer(),
            upload_block(3, true, &[0u8; 1024], 0),
            0,
            Instant::now(),
        );
        assert!(matches!(
            disposition,
            RequestDisposition::Reply(reply) if reply.code == Code::REQUEST_ENTITY_INCOMPLETE
        ));
    }

    #[test]
    fn test_block1_overflow_yields_too_large() {
        let mut engine = BlockwiseEngine::new(true, Szx::S1024, Duration::from_secs(5), 1500);
        let now = Instant::now();
        engine.on_request(peer(), upload_block(0, true, &[0u8; 1024], 0), 0, now);
        let disposition = engine.on_request(peer(), upload_block(1, true, &[0u8; 1024], 1), 0, now);
        match disposition {
            RequestDisposition::Reply(reply) => {
                assert_eq!(reply.code, Code::REQUEST_ENTITY_TOO_LARGE)
            }
            other => panic!("expected 4.13, got {:?}", other),
        }
        assert_eq!(engine.active_transfers(), 0);
    }

    #[test]
    fn test_block1_lower_szx_wins() {
        let mut engine = BlockwiseEngine::new(true, Szx::S512, Duration::from_secs(5), 65535);
        let disposition = engine.on_request(
            peer(),
            upload_block(0, true, &[0u8; 1024], 0),
            0,
            Instant::now(),
        );
        match disposition {
            RequestDisposition::Reply(reply) => {
                let echo = reply.block(option::BLOCK1).unwrap().unwrap();
                assert_eq!(echo.szx, Szx::S512);
            }
            other => panic!("expected continue, got {:?}", other),
        }
    }

    #[test]
    fn test_transfer_expires_after_timeout() {
        let mut engine = engine();
        let now = Instant::now();
        engine.on_request(peer(), upload_block(0, true, &[0u8; 1024], 0), 0, now);
        assert_eq!(engine.active_transfers(), 1);

        // Past the transfer timeout the next block finds no state.
        let later = now + Duration::from_secs(6);
        let disposition = engine.on_request(peer(), upload_block(1, true, &[0u8; 1024], 1), 0, later);
        assert!(matches!(
            disposition,
            RequestDisposition::Reply(reply) if reply.code == Code::REQUEST_ENTITY_INCOMPLETE
        ));
    }

    fn download_request(num: u32, mid: MessageId) -> Message {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, mid);
        msg.token = Token::new(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        msg.set_path("/big");
        if num > 0 {
            msg.set_block(
                option::BLOCK2,
                BlockValue::new(num, false, Szx::S1024).unwrap(),
            );
        }
        msg
    }

    #[test]
    fn test_block2_slices_and_serves_from_cache() {
        let mut engine = engine();
        let now = Instant::now();
        let body: Vec<u8> = (0..2560u32).map(|i| (i % 251) as u8).collect();

        // Handler produced a 2560-byte response to the initial GET.
        let request = download_request(0, 0x10);
        let mut response = Message::ack_with(0x10, request.token, Code::CONTENT);
        response.payload = Bytes::copy_from_slice(&body);
        let first = engine.on_response(peer(), &request, response, now);

        let block = first.block(option::BLOCK2).unwrap().unwrap();
        assert_eq!((block.num, block.more, block.szx), (0, true, Szx::S1024));
        assert_eq!(first.payload.as_ref(), &body[..1024]);
        assert_eq!(
            option::decode_uint(first.option(option::SIZE2).unwrap()),
            Some(2560)
        );
        assert_eq!(engine.cached_responses(), 1);

        // Continuations are answered from the cache without the handler.
        let continuation = download_request(2, 0x12);
        match engine.on_request(peer(), continuation, 0, now) {
            RequestDisposition::Reply(reply) => {
                assert_eq!(reply.code, Code::CONTENT);
                let block = reply.block(option::BLOCK2).unwrap().unwrap();
                assert_eq!((block.num, block.more), (2, false));
                assert_eq!(reply.payload.as_ref(), &body[2048..]);
                assert!(reply.option(option::SIZE2).is_none());
            }
            other => panic!("expected cached slice, got {:?}", other),
        }
    }

    #[test]
    fn test_block2_number_past_end() {
        let mut engine = engine();
        let now = Instant::now();
        let request = download_request(0, 0x10);
        let mut response = Message::ack_with(0x10, request.token, Code::CONTENT);
        response.payload = Bytes::from(vec![0u8; 2048]);
        engine.on_response(peer(), &request, response, now);

        match engine.on_request(peer(), download_request(9, 0x11), 0, now) {
            RequestDisposition::Reply(reply) => assert_eq!(reply.code, Code::BAD_OPTION),
            other => panic!("expected 4.02, got {:?}", other),
        }
    }

    #[test]
    fn test_block2_cache_miss_redelivers() {
        let mut engine = engine();
        // No cached response: the handler must be asked again.
        let disposition = engine.on_request(peer(), download_request(1, 0x11), 0, Instant::now());
        assert!(matches!(disposition, RequestDisposition::Deliver(_)));
    }

    #[test]
    fn test_small_response_passes_through() {
        let mut engine = engine();
        let request = download_request(0, 0x10);
        let mut response = Message::ack_with(0x10, request.token, Code::CONTENT);
        response.payload = Bytes::from_static(b"small");
        let out = engine.on_response(peer(), &request, response, Instant::now());
        assert!(out.option(option::BLOCK2).is_none());
        assert_eq!(out.payload.as_ref(), b"small");
        assert_eq!(engine.cached_responses(), 0);
    }

    #[test]
    fn test_fingerprint_ignores_no_cache_key_options() {
        let first = download_request(0, 0x10);
        let continuation = download_request(2, 0x11);
        assert_eq!(
            Fingerprint::of(peer(), &first),
            Fingerprint::of(peer(), &continuation)
        );

        let mut other_path = download_request(0, 0x12);
        other_path.set_path("/other");
        assert_ne!(
            Fingerprint::of(peer(), &first),
            Fingerprint::of(peer(), &other_path)
        );
    }
}
