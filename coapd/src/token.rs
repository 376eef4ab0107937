//! Token registry: pairing responses and notifications with waiters.
//!
//! A one-shot entry fires once and is removed; an observer entry keeps
//! firing for every fresh notification until the user cancels, the peer
//! deregisters (response without an Observe option) or an error-class
//! response arrives. Observe freshness follows RFC 7641 Section 3.4:
//! 24-bit serial comparison with a wall-clock override window.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use coapd_msg::{Message, Token};
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// Notifications buffered per observation before the registry starts
/// dropping.
pub const OBSERVATION_BUFFER: usize = 16;

/// Generate a fresh 8-byte random token.
pub fn generate() -> Token {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    Token::new(&bytes).expect("8 bytes is a valid token")
}

/// What kind of waiter a token is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    OneShot,
    Observer,
}

enum TokenEntry {
    OneShot(oneshot::Sender<Result<Message, Error>>),
    Observer {
        tx: mpsc::Sender<Result<Message, Error>>,
        last: Option<(u32, Instant)>,
    },
}

/// Outcome of dispatching an inbound response or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered; a one-shot entry was consumed, an observer entry stays.
    Delivered { keep_registered: bool },
    /// Notification older than the last delivered one by the freshness
    /// rule; dropped.
    Stale,
    /// Observer channel full; notification dropped.
    Lagging,
    /// No waiter registered under this token.
    NotRegistered,
}

/// Per-session token registry.
pub struct TokenRegistry {
    freshness_window: Duration,
    entries: HashMap<Token, TokenEntry>,
}

impl TokenRegistry {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            freshness_window,
            entries: HashMap::new(),
        }
    }

    /// Register a one-shot waiter.
    pub fn register(&mut self, token: Token, tx: oneshot::Sender<Result<Message, Error>>) {
        self.entries.insert(token, TokenEntry::OneShot(tx));
    }

    /// Register an observer, returning the notification stream.
    pub fn register_observer(&mut self, token: Token) -> mpsc::Receiver<Result<Message, Error>> {
        let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);
        self.entries
            .insert(token, TokenEntry::Observer { tx, last: None });
        rx
    }

    pub fn kind(&self, token: &Token) -> Option<HandlerKind> {
        self.entries.get(token).map(|entry| match entry {
            TokenEntry::OneShot(_) => HandlerKind::OneShot,
            TokenEntry::Observer { .. } => HandlerKind::Observer,
        })
    }

    /// Route an inbound response to its waiter.
    pub fn dispatch(&mut self, token: Token, msg: Message, now: Instant) -> DispatchOutcome {
        match self.entries.get(&token) {
            None => DispatchOutcome::NotRegistered,
            Some(TokenEntry::OneShot(_)) => {
                if let Some(TokenEntry::OneShot(tx)) = self.entries.remove(&token) {
                    let _ = tx.send(Ok(msg));
                }
                DispatchOutcome::Delivered {
                    keep_registered: false,
                }
            }
            Some(TokenEntry::Observer { .. }) => self.dispatch_notification(token, msg, now),
        }
    }

    fn dispatch_notification(&mut self, token: Token, msg: Message, now: Instant) -> DispatchOutcome {
        // De-registration by peer or a terminal error class ends the
        // observation after delivering this final message.
        let terminal = msg.observe().is_none() || msg.code.is_error_response();

        let (outcome, remove) = {
            let Some(TokenEntry::Observer { tx, last }) = self.entries.get_mut(&token) else {
                return DispatchOutcome::NotRegistered;
            };
            if !terminal {
                let seq = msg.observe().expect("non-terminal implies observe present");
                if let Some((last_seq, last_at)) = *last {
                    if !is_fresher(last_seq, seq, last_at, now, self.freshness_window) {
                        return DispatchOutcome::Stale;
                    }
                }
                *last = Some((seq, now));
            }
            match tx.try_send(Ok(msg)) {
                Ok(()) => (
                    DispatchOutcome::Delivered {
                        keep_registered: !terminal,
                    },
                    terminal,
                ),
                Err(mpsc::error::TrySendError::Full(_)) => (DispatchOutcome::Lagging, false),
                Err(mpsc::error::TrySendError::Closed(_)) => (DispatchOutcome::NotRegistered, true),
            }
        };

        if remove {
            self.entries.remove(&token);
        }
        outcome
    }

    /// Fail a single waiter (RST, transmit timeout, user cancel of the
    /// exchange). Idempotent.
    pub fn fail(&mut self, token: Token, err: Error) {
        match self.entries.remove(&token) {
            None => {}
            Some(TokenEntry::OneShot(tx)) => {
                let _ = tx.send(Err(err));
            }
            Some(TokenEntry::Observer { tx, .. }) => {
                let _ = tx.try_send(Err(err));
            }
        }
    }

    /// Remove a waiter without notifying it. Idempotent.
    pub fn cancel(&mut self, token: Token) {
        self.entries.remove(&token);
    }

    /// Fail every waiter (session shutdown).
    pub fn fail_all(&mut self, err: impl Fn() -> Error) {
        for (_, entry) in self.entries.drain() {
            match entry {
                TokenEntry::OneShot(tx) => {
                    let _ = tx.send(Err(err()));
                }
                TokenEntry::Observer { tx, .. } => {
                    let _ = tx.try_send(Err(err()));
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// RFC 7641 Section 3.4 freshness: `incoming` supersedes `last` when the
/// 24-bit serial moved forward by less than 2^23, or the last delivery is
/// older than the freshness window.
fn is_fresher(last: u32, incoming: u32, last_at: Instant, now: Instant, window: Duration) -> bool {
    const HALF: u32 = 1 << 23;
    (last < incoming && incoming - last < HALF)
        || (last > incoming && last - incoming > HALF)
        || now.duration_since(last_at) > window
}
