//! Error types for the endpoint runtime.
//!
//! Codec errors are wrapped rather than re-declared; the runtime adds the
//! timing and lifecycle failures that only exist once timers, peers and
//! shutdown are involved.

use coapd_msg::Code;
use thiserror::Error;

/// Convenience alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors surfaced to request senders, observation handles and the
/// session error sink.
#[derive(Debug, Error)]
pub enum Error {
    /// Inbound datagram could not be parsed. Logged and dropped; never
    /// surfaced to handlers.
    #[error("decode: {0}")]
    Decode(#[from] coapd_msg::DecodeError),

    /// Outbound message could not be serialized. Fatal to the single send
    /// operation only.
    #[error("encode: {0}")]
    Encode(#[from] coapd_msg::EncodeError),

    /// The peer rejected our confirmable message with a Reset.
    #[error("peer answered with reset")]
    Reset,

    /// A response carried critical options this endpoint does not
    /// recognise.
    #[error("unrecognised critical options {0:?} in response")]
    BadOption(Vec<u16>),

    /// A block option could not be parsed.
    #[error("malformed block option: {0}")]
    Block(#[from] coapd_msg::block::BlockError),

    /// The peer returned an unusable reply during a block-wise exchange.
    #[error("unexpected {0} during block-wise transfer")]
    BlockProtocol(Code),

    /// MAX_RETRANSMIT retransmissions elapsed without an ACK.
    #[error("no acknowledgement after {attempts} retransmissions")]
    TransmitTimeout { attempts: u32 },

    /// A block-wise transfer made no progress within the transfer timeout.
    #[error("block-wise transfer timed out")]
    BlockTransferTimeout,

    /// An observe notification older than the last delivered one was
    /// dropped. Reported to the error sink only; the stream stays intact.
    #[error("stale observe notification dropped")]
    ObserveStale,

    /// The operation's cancellation token fired, or the session shut down
    /// underneath it.
    #[error("operation cancelled")]
    Cancelled,

    /// The handler pool refused the work item; the message was dropped
    /// without acknowledgement so the peer will retransmit.
    #[error("handler pool saturated")]
    Overloaded,

    /// The session or handle is closed.
    #[error("closed")]
    Closed,

    /// Transport-level failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error ends the session (as opposed to the single
    /// operation that produced it).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Closed | Error::Io(_))
    }
}

/// Sink for background errors the session cannot attribute to a waiting
/// caller (decode failures, handler pool rejections, transport hiccups).
///
/// The default sink logs through `tracing`; no process-global state is
/// involved.
pub type ErrorSink = std::sync::Arc<dyn Fn(&Error) + Send + Sync>;

/// The default error sink: structured warning log.
pub fn default_error_sink() -> ErrorSink {
    std::sync::Arc::new(|err| {
        tracing::warn!(error = %err, "session error");
    })
}
