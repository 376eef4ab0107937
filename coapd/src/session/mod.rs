//! Per-connection session driver.
//!
//! One session per remote endpoint, gluing transport, codec, reliability
//! and user handlers together. The reader task decodes datagrams and
//! routes them synchronously through dedup, the retransmit queue, the
//! token registry and the block-wise engine; user handlers run on the
//! work pool so nothing ever blocks the reader. A dedicated writer task
//! serialises every outbound datagram, so socket-write order matches
//! enqueue order.

mod response;

pub use response::ResponseWriter;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use coapd_msg::block::BlockValue;
use coapd_msg::{codec, option, Code, Message, MessageId, MessageType, Token};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::blockwise::{BlockwiseEngine, RequestDisposition};
use crate::config::Config;
use crate::dedup::{DedupCache, DedupOutcome};
use crate::dispatch::WorkPool;
use crate::error::{Error, ErrorSink, Result};
use crate::observe::Observation;
use crate::pool;
use crate::retransmit::{RetransmitQueue, TimeoutAction};
use crate::token::{self, TokenRegistry};
use crate::transport::Conn;

/// Request handler: receives the response writer and the decoded,
/// reassembled request. Runs on the work pool, never on the reader.
pub type Handler = Arc<dyn Fn(&mut ResponseWriter, &Message) + Send + Sync>;

/// Outbound datagrams buffered for the writer task.
const WRITE_QUEUE: usize = 1024;

struct SessionState {
    retransmit: RetransmitQueue,
    dedup: DedupCache,
    tokens: TokenRegistry,
    blockwise: BlockwiseEngine,
    pings: HashMap<MessageId, oneshot::Sender<Result<()>>>,
    closed: bool,
}

struct SessionInner {
    conn: Arc<dyn Conn>,
    peer: SocketAddr,
    config: Config,
    handler: Handler,
    work_pool: Arc<dyn WorkPool>,
    errors: ErrorSink,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    write_tx: mpsc::Sender<Bytes>,
    write_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    /// Wakes the retransmission timer task when the queue changes.
    retx_changed: Notify,
    next_mid: AtomicU16,
    nstart: Arc<Semaphore>,
}

/// One CoAP session over a single connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        conn: Box<dyn Conn>,
        config: Config,
        handler: Handler,
        work_pool: Arc<dyn WorkPool>,
        errors: ErrorSink,
    ) -> Self {
        let conn: Arc<dyn Conn> = Arc::from(conn);
        let peer = conn.peer_addr();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let exchange_lifetime = config.transmission.exchange_lifetime();
        let state = SessionState {
            retransmit: RetransmitQueue::new(config.transmission.clone()),
            dedup: DedupCache::new(exchange_lifetime),
            tokens: TokenRegistry::new(config.observer.freshness_window),
            blockwise: BlockwiseEngine::new(
                config.blockwise.enable,
                config.blockwise.preferred_szx(),
                config.blockwise.transfer_timeout,
                config.max_message_size,
            ),
            pings: HashMap::new(),
            closed: false,
        };
        let nstart = Arc::new(Semaphore::new(config.transmission.nstart));
        Self {
            inner: Arc::new(SessionInner {
                conn,
                peer,
                config,
                handler,
                work_pool,
                errors,
                cancel: CancellationToken::new(),
                state: Mutex::new(state),
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
                retx_changed: Notify::new(),
                next_mid: AtomicU16::new(rand::thread_rng().gen()),
                nstart,
            }),
        }
    }

    /// The remote endpoint this session talks to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Cancellation token covering the whole session.
    pub fn cancelled(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Begin session shutdown.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Drive the session until the connection ends or the session is
    /// closed. Runs the reader inline and spawns the writer and
    /// retransmission timer tasks.
    pub async fn run(&self) -> Result<()> {
        let writer = tokio::spawn(Self::write_loop(self.inner.clone()));
        let timer = tokio::spawn(Self::retransmit_loop(self.inner.clone()));

        let result = self.read_loop().await;

        self.inner.finalize();
        let _ = writer.await;
        let _ = timer.await;
        result
    }

    async fn read_loop(&self) -> Result<()> {
        let inner = &self.inner;
        let mut buf = vec![0u8; codec::DEFAULT_MAX_MESSAGE_SIZE];
        loop {
            let len = match inner.conn.recv(&mut buf, &inner.cancel).await {
                Ok(len) => len,
                Err(Error::Cancelled) | Err(Error::Closed) => return Ok(()),
                Err(err) => {
                    (inner.errors)(&err);
                    return Err(err);
                }
            };
            let data = Bytes::copy_from_slice(&buf[..len]);
            match codec::decode_bounded(data, inner.config.max_message_size) {
                // Framing errors are logged and the packet dropped; no
                // reply, the handler never sees it.
                Err(err) => {
                    trace!(peer = %inner.peer, error = %err, "dropping undecodable datagram");
                    (inner.errors)(&Error::Decode(err));
                }
                Ok(msg) => SessionInner::route(inner, msg).await,
            }
        }
    }

    async fn write_loop(inner: Arc<SessionInner>) {
        let Some(mut rx) = inner
            .write_rx
            .lock()
            .expect("write_rx mutex poisoned")
            .take()
        else {
            return;
        };
        loop {
            let datagram = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                datagram = rx.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            if let Err(err) = inner.conn.send(&datagram, &inner.cancel).await {
                let fatal = err.is_fatal() || matches!(err, Error::Cancelled);
                (inner.errors)(&err);
                if fatal {
                    inner.cancel.cancel();
                    break;
                }
            }
        }
    }

    async fn retransmit_loop(inner: Arc<SessionInner>) {
        loop {
            let deadline = inner
                .state
                .lock()
                .expect("state mutex poisoned")
                .retransmit
                .next_deadline();
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.retx_changed.notified() => continue,
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let actions = inner
                        .state
                        .lock()
                        .expect("state mutex poisoned")
                        .retransmit
                        .fire(Instant::now());
                    for action in actions {
                        match action {
                            TimeoutAction::Resend { datagram, peer } => {
                                trace!(%peer, "retransmitting confirmable");
                                if inner.write_tx.try_send(datagram).is_err() {
                                    (inner.errors)(&Error::Overloaded);
                                }
                            }
                            TimeoutAction::Expire { message_id, token, attempts } => {
                                debug!(peer = %inner.peer, message_id, attempts, "transmit timeout");
                                inner.expire_exchange(message_id, token, attempts);
                            }
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    /// Send a request and await its terminal response.
    ///
    /// Assigns a random token and message ID, honors NSTART admission,
    /// retransmits confirmables and performs block-wise transfer in both
    /// directions when enabled.
    pub async fn request(&self, mut msg: Message, cancel: &CancellationToken) -> Result<Message> {
        let _permit = self.acquire_nstart(cancel).await?;
        if msg.token.is_empty() {
            msg.token = token::generate();
        }

        let blockwise = &self.inner.config.blockwise;
        let first = if blockwise.enable && msg.payload.len() > blockwise.preferred_szx().size() {
            self.upload_blockwise(&msg, cancel).await?
        } else {
            self.exchange(msg.clone(), cancel).await?
        };

        self.download_blockwise(&msg, first, cancel).await
    }

    /// GET a path.
    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<Message> {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0);
        msg.set_path(path);
        self.request(msg, cancel).await
    }

    /// POST a payload to a path.
    pub async fn post(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let mut msg = Message::new(MessageType::Confirmable, Code::POST, 0);
        msg.set_path(path);
        msg.payload = payload.into();
        self.request(msg, cancel).await
    }

    /// PUT a payload to a path.
    pub async fn put(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let mut msg = Message::new(MessageType::Confirmable, Code::PUT, 0);
        msg.set_path(path);
        msg.payload = payload.into();
        self.request(msg, cancel).await
    }

    /// DELETE a path.
    pub async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<Message> {
        let mut msg = Message::new(MessageType::Confirmable, Code::DELETE, 0);
        msg.set_path(path);
        self.request(msg, cancel).await
    }

    /// Register interest in a resource (RFC 7641) and return the
    /// notification stream. Notifications, including the initial
    /// response, arrive through the returned [`Observation`].
    pub async fn observe(&self, path: &str, cancel: &CancellationToken) -> Result<Observation> {
        let token = token::generate();
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, self.inner.next_mid());
        msg.token = token;
        msg.set_path(path);
        msg.set_observe(0);
        let datagram = codec::encode_to_bytes(&msg)?;

        let rx = {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            if state.closed {
                return Err(Error::Closed);
            }
            let rx = state.tokens.register_observer(token);
            state.retransmit.register(
                msg.message_id,
                token,
                datagram.clone(),
                self.inner.peer,
                Instant::now(),
            );
            rx
        };
        self.inner.retx_changed.notify_one();
        if let Err(err) = self.enqueue(datagram, cancel).await {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            state.tokens.cancel(token);
            state.retransmit.cancel_token(token);
            return Err(err);
        }

        let inner = self.inner.clone();
        let path = path.to_string();
        let on_cancel = Box::new(move || inner.deregister_observation(token, &path));
        Ok(Observation::new(rx, on_cancel))
    }

    /// Empty-CON liveness probe. The peer's Reset (or ACK) counts as a
    /// pong.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let mid = self.inner.next_mid();
        let msg = Message::new(MessageType::Confirmable, Code::EMPTY, mid);
        let datagram = codec::encode_to_bytes(&msg)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            if state.closed {
                return Err(Error::Closed);
            }
            state.pings.insert(mid, tx);
            state.retransmit.register(
                mid,
                Token::empty(),
                datagram.clone(),
                self.inner.peer,
                Instant::now(),
            );
        }
        self.inner.retx_changed.notify_one();
        if let Err(err) = self.enqueue(datagram, cancel).await {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            state.pings.remove(&mid);
            state.retransmit.acknowledge(mid);
            return Err(err);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut state = self.inner.state.lock().expect("state mutex poisoned");
                state.pings.remove(&mid);
                state.retransmit.acknowledge(mid);
                Err(Error::Cancelled)
            }
            outcome = rx => outcome.unwrap_or(Err(Error::Closed)),
        }
    }

    // ------------------------------------------------------------------
    // Client internals
    // ------------------------------------------------------------------

    async fn acquire_nstart(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.inner.cancel.cancelled() => Err(Error::Closed),
            permit = self.inner.nstart.clone().acquire_owned() => {
                permit.map_err(|_| Error::Closed)
            }
        }
    }

    /// One request/response round: register the token, send, await the
    /// terminal result.
    async fn exchange(&self, mut msg: Message, cancel: &CancellationToken) -> Result<Message> {
        msg.message_id = self.inner.next_mid();
        let datagram = codec::encode_to_bytes(&msg)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            if state.closed {
                return Err(Error::Closed);
            }
            state.tokens.register(msg.token, tx);
            if msg.ty == MessageType::Confirmable {
                state.retransmit.register(
                    msg.message_id,
                    msg.token,
                    datagram.clone(),
                    self.inner.peer,
                    Instant::now(),
                );
            }
        }
        self.inner.retx_changed.notify_one();
        if let Err(err) = self.enqueue(datagram, cancel).await {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            state.tokens.cancel(msg.token);
            state.retransmit.cancel_token(msg.token);
            return Err(err);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut state = self.inner.state.lock().expect("state mutex poisoned");
                state.tokens.cancel(msg.token);
                state.retransmit.cancel_token(msg.token);
                Err(Error::Cancelled)
            }
            response = rx => {
                let response = response.unwrap_or(Err(Error::Closed))?;
                if !response.unknown_critical_options().is_empty() {
                    return Err(Error::BadOption(response.unknown_critical_options()));
                }
                Ok(response)
            }
        }
    }

    /// Client Block1 upload: slice the payload, send each block, follow
    /// 2.31 Continues (adopting a smaller SZX if the server insists) until
    /// the final response.
    async fn upload_blockwise(
        &self,
        msg: &Message,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let payload = msg.payload.clone();
        let timeout = self.inner.config.blockwise.transfer_timeout;
        let mut szx = self.inner.config.blockwise.preferred_szx();
        let mut offset = 0usize;

        loop {
            // The offset stays a multiple of every smaller block size, so
            // renumbering after an SZX reduction is a plain division.
            let end = (offset + szx.size()).min(payload.len());
            let more = end < payload.len();
            let block = BlockValue::new((offset / szx.size()) as u32, more, szx)?;
            let chunk = payload.slice(offset..end);

            let mut sub = msg.clone();
            sub.set_block(option::BLOCK1, block);
            sub.payload = chunk.clone();

            let response = tokio::time::timeout(timeout, self.exchange(sub, cancel))
                .await
                .map_err(|_| Error::BlockTransferTimeout)??;

            if !block.more {
                return Ok(response);
            }
            if response.code != Code::CONTINUE {
                // Early terminal response (4.13, 4.08, or success).
                return Ok(response);
            }
            if let Some(echo) = response.block(option::BLOCK1)? {
                szx = echo.szx.min(szx);
            }
            offset += chunk.len();
        }
    }

    /// Client Block2 download: follow `more` flags, re-issuing the
    /// request for each further block and reassembling the payload.
    async fn download_blockwise(
        &self,
        original: &Message,
        first: Message,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let Some(block) = first.block(option::BLOCK2)? else {
            return Ok(first);
        };
        let timeout = self.inner.config.blockwise.transfer_timeout;
        let mut assembled = BytesMut::from(&first.payload[..]);
        let mut szx = block.szx;
        let mut more = block.more;

        while more {
            let num = (assembled.len() / szx.size()) as u32;
            let mut next = original.clone();
            next.payload = Bytes::new();
            next.remove_option(option::BLOCK1);
            next.set_block(option::BLOCK2, BlockValue::new(num, false, szx)?);

            let response = tokio::time::timeout(timeout, self.exchange(next, cancel))
                .await
                .map_err(|_| Error::BlockTransferTimeout)??;
            if response.code.is_error_response() {
                return Ok(response);
            }
            let Some(echo) = response.block(option::BLOCK2)? else {
                return Err(Error::BlockProtocol(response.code));
            };
            if echo.offset() != assembled.len() {
                return Err(Error::BlockProtocol(response.code));
            }
            assembled.extend_from_slice(&response.payload);
            szx = echo.szx.min(szx);
            more = echo.more;
        }

        let mut out = first;
        out.payload = assembled.freeze();
        out.remove_option(option::BLOCK2);
        out.remove_option(option::SIZE2);
        Ok(out)
    }

    async fn enqueue(&self, datagram: Bytes, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.inner.cancel.cancelled() => Err(Error::Closed),
            sent = self.inner.write_tx.send(datagram) => sent.map_err(|_| Error::Closed),
        }
    }
}

impl SessionInner {
    fn next_mid(&self) -> MessageId {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    /// Route one decoded inbound message. Called from the reader only.
    async fn route(inner: &Arc<Self>, msg: Message) {
        trace!(peer = %inner.peer, ty = ?msg.ty, code = %msg.code, message_id = msg.message_id, "inbound");
        match msg.ty {
            MessageType::Acknowledgement => inner.on_ack(msg),
            MessageType::Reset => inner.on_reset(msg),
            MessageType::Confirmable | MessageType::NonConfirmable => {
                // Every inbound confirmable passes the dedup cache first,
                // whatever its code: a duplicate neither reaches the
                // handler twice nor goes unanswered.
                if msg.ty == MessageType::Confirmable {
                    let outcome = {
                        let mut state = inner.state.lock().expect("state mutex poisoned");
                        state.dedup.observe(inner.peer, msg.message_id, Instant::now())
                    };
                    match outcome {
                        DedupOutcome::Replay(datagram) => {
                            debug!(peer = %inner.peer, message_id = msg.message_id, "duplicate confirmable, replaying reply");
                            inner.send_datagram(datagram).await;
                            return;
                        }
                        DedupOutcome::InFlight => {
                            debug!(peer = %inner.peer, message_id = msg.message_id, "duplicate confirmable still in flight");
                            return;
                        }
                        DedupOutcome::New => {}
                    }
                }

                if msg.code.is_empty() {
                    // Empty CON is the ping probe: provoke a Reset.
                    if msg.ty == MessageType::Confirmable {
                        inner.send_reset(msg.message_id).await;
                    }
                } else if msg.code.is_request() {
                    Self::on_request(inner, msg).await;
                } else {
                    inner.on_separate_response(msg).await;
                }
            }
        }
    }

    fn on_ack(&self, msg: Message) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        state.retransmit.acknowledge(msg.message_id);
        self.retx_changed.notify_one();

        if msg.code.is_empty() {
            // An empty ACK to a ping is a pong; an empty ACK to a request
            // only silences retransmission, the response follows.
            if let Some(tx) = state.pings.remove(&msg.message_id) {
                let _ = tx.send(Ok(()));
            }
            return;
        }
        let token = msg.token;
        if state.tokens.dispatch(token, msg, Instant::now()) == crate::token::DispatchOutcome::Stale
        {
            (self.errors)(&Error::ObserveStale);
        }
    }

    fn on_reset(&self, msg: Message) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        let entry = state.retransmit.acknowledge(msg.message_id);
        self.retx_changed.notify_one();

        // A Reset answering our empty-CON probe is a liveness signal.
        if let Some(tx) = state.pings.remove(&msg.message_id) {
            let _ = tx.send(Ok(()));
            return;
        }
        if let Some(entry) = entry {
            state.tokens.fail(entry.token, Error::Reset);
        }
    }

    /// A CON or NON response arriving on its own (not piggybacked).
    async fn on_separate_response(&self, msg: Message) {
        let (ty, message_id, token) = (msg.ty, msg.message_id, msg.token);
        let outcome = {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.tokens.dispatch(token, msg, Instant::now())
        };
        match outcome {
            crate::token::DispatchOutcome::NotRegistered => {
                // Unexpected response: reject confirmables so the peer
                // stops retransmitting (and deregisters us if it was an
                // observe notification).
                if ty == MessageType::Confirmable {
                    self.send_reset(message_id).await;
                }
            }
            outcome => {
                if let crate::token::DispatchOutcome::Stale = outcome {
                    trace!(peer = %self.peer, message_id, "stale observe notification dropped");
                    (self.errors)(&Error::ObserveStale);
                }
                if ty == MessageType::Confirmable {
                    self.send_empty_ack(message_id).await;
                }
            }
        }
    }

    async fn on_request(inner: &Arc<Self>, msg: Message) {
        let now = Instant::now();
        let is_con = msg.ty == MessageType::Confirmable;
        let reply_mid = inner.next_mid();
        let disposition = {
            let mut state = inner.state.lock().expect("state mutex poisoned");
            state.blockwise.on_request(inner.peer, msg, reply_mid, now)
        };

        match disposition {
            RequestDisposition::Reply(reply) => {
                inner.send_reply(&reply, is_con).await;
            }
            RequestDisposition::Deliver(request) => {
                let unknown = request.unknown_critical_options();
                if !unknown.is_empty() {
                    debug!(peer = %inner.peer, options = ?unknown, "rejecting request with unknown critical options");
                    let reply = inner.reply_shell(&request, Code::BAD_OPTION);
                    inner.send_reply(&reply, is_con).await;
                    return;
                }
                Self::dispatch_to_handler(inner, request);
            }
        }
    }

    /// Hand a complete request to the user handler on the work pool. The
    /// reader does not wait; a rejected submission drops the message
    /// without acknowledgement and the peer retransmits.
    fn dispatch_to_handler(inner: &Arc<Self>, request: Message) {
        let worker = Arc::clone(inner);
        let submitted = inner.work_pool.submit(Box::new(move || {
            let mut writer = ResponseWriter::new();
            (worker.handler)(&mut writer, &request);
            worker.complete_request(request, writer);
        }));
        if let Err(err) = submitted {
            (inner.errors)(&err);
        }
    }

    /// Runs on the work pool after the handler returns: assemble the
    /// response, run it through the block-wise engine, remember it for
    /// dedup replay and enqueue it.
    fn complete_request(&self, request: Message, writer: ResponseWriter) {
        let is_con = request.ty == MessageType::Confirmable;
        if !writer.has_response() {
            // Handler chose not to respond; a confirmable still needs its
            // ACK.
            if is_con {
                let mut ack = pool::acquire();
                ack.ty = MessageType::Acknowledgement;
                ack.message_id = request.message_id;
                match codec::encode_to_bytes(&ack) {
                    Ok(datagram) => self.store_and_send_blocking(&request, datagram, is_con),
                    Err(err) => (self.errors)(&Error::Encode(err)),
                }
            }
            return;
        }

        let mut response = self.reply_shell(&request, Code::EMPTY);
        writer.apply_to(&mut response);

        let response = {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state
                .blockwise
                .on_response(self.peer, &request, response, Instant::now())
        };

        match codec::encode_to_bytes(&response) {
            Ok(datagram) => self.store_and_send_blocking(&request, datagram, is_con),
            Err(err) => (self.errors)(&Error::Encode(err)),
        }
    }

    fn store_and_send_blocking(&self, request: &Message, datagram: Bytes, is_con: bool) {
        if is_con {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state
                .dedup
                .store_response(self.peer, request.message_id, datagram.clone());
        }
        if self.write_tx.blocking_send(datagram).is_err() {
            (self.errors)(&Error::Closed);
        }
    }

    /// Reply skeleton matching the request's reliability mode.
    fn reply_shell(&self, request: &Message, code: Code) -> Message {
        match request.ty {
            MessageType::Confirmable => {
                Message::ack_with(request.message_id, request.token, code)
            }
            _ => {
                let mut msg = Message::new(MessageType::NonConfirmable, code, self.next_mid());
                msg.token = request.token;
                msg
            }
        }
    }

    async fn send_reply(&self, reply: &Message, store_for_dedup: bool) {
        match codec::encode_to_bytes(reply) {
            Ok(datagram) => {
                if store_for_dedup && reply.ty == MessageType::Acknowledgement {
                    let mut state = self.state.lock().expect("state mutex poisoned");
                    state
                        .dedup
                        .store_response(self.peer, reply.message_id, datagram.clone());
                }
                self.send_datagram(datagram).await;
            }
            Err(err) => (self.errors)(&Error::Encode(err)),
        }
    }

    async fn send_empty_ack(&self, message_id: MessageId) {
        let mut ack = pool::acquire();
        ack.ty = MessageType::Acknowledgement;
        ack.message_id = message_id;
        match codec::encode_to_bytes(&ack) {
            Ok(datagram) => {
                self.remember_reply(message_id, datagram.clone());
                self.send_datagram(datagram).await;
            }
            Err(err) => (self.errors)(&Error::Encode(err)),
        }
    }

    async fn send_reset(&self, message_id: MessageId) {
        let mut rst = pool::acquire();
        rst.ty = MessageType::Reset;
        rst.message_id = message_id;
        match codec::encode_to_bytes(&rst) {
            Ok(datagram) => {
                self.remember_reply(message_id, datagram.clone());
                self.send_datagram(datagram).await;
            }
            Err(err) => (self.errors)(&Error::Encode(err)),
        }
    }

    /// Attach a reply to the dedup entry of the confirmable it answers.
    /// No-op when the message id was not a tracked confirmable.
    fn remember_reply(&self, message_id: MessageId, datagram: Bytes) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        state.dedup.store_response(self.peer, message_id, datagram);
    }

    async fn send_datagram(&self, datagram: Bytes) {
        if self.write_tx.send(datagram).await.is_err() {
            (self.errors)(&Error::Closed);
        }
    }

    /// Expire one confirmable exchange after MAX_RETRANSMIT.
    fn expire_exchange(&self, message_id: MessageId, token: Token, attempts: u32) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if let Some(tx) = state.pings.remove(&message_id) {
            let _ = tx.send(Err(Error::TransmitTimeout { attempts }));
            return;
        }
        state.tokens.fail(token, Error::TransmitTimeout { attempts });
    }

    /// Best-effort observe deregistration: drop the local registration
    /// and tell the peer with a GET carrying Observe(1).
    fn deregister_observation(&self, token: Token, path: &str) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        state.tokens.cancel(token);
        if state.closed {
            return;
        }
        drop(state);

        let mut msg = Message::new(MessageType::NonConfirmable, Code::GET, self.next_mid());
        msg.token = token;
        msg.set_path(path);
        msg.set_observe(1);
        match codec::encode_to_bytes(&msg) {
            Ok(datagram) => {
                if self.write_tx.try_send(datagram).is_err() {
                    debug!(peer = %self.peer, "observe deregistration dropped, write queue full");
                }
            }
            Err(err) => (self.errors)(&Error::Encode(err)),
        }
    }

    /// Ordered shutdown: mark cancelled, stop accepting work, fail
    /// pending exchanges and waiters, stop reader and writer, release
    /// buffers.
    fn finalize(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().expect("state mutex poisoned");
        state.closed = true;

        for entry in state.retransmit.drain() {
            if let Some(tx) = state.pings.remove(&entry.message_id) {
                let _ = tx.send(Err(Error::Cancelled));
            }
        }
        for (_, tx) in state.pings.drain() {
            let _ = tx.send(Err(Error::Cancelled));
        }
        state.tokens.fail_all(|| Error::Cancelled);
        state.blockwise.clear();
        drop(state);

        self.conn.close();
        debug!(peer = %self.peer, "session finalized");
    }
}
