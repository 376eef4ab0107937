//! Confirmable-message retransmission (RFC 7252 Section 4.2).
//!
//! A passive, deadline-driven queue: the session's timer task asks for
//! the next deadline, sleeps until it, and calls [`RetransmitQueue::fire`]
//! to collect resend and expiry actions. Keeping the queue free of timers
//! and I/O makes the backoff schedule directly testable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

use bytes::Bytes;
use coapd_msg::{MessageId, Token};
use rand::Rng;

use crate::config::TransmissionConfig;

/// One outbound confirmable awaiting ACK or RST.
#[derive(Debug, Clone)]
pub struct PendingExchange {
    pub message_id: MessageId,
    pub token: Token,
    pub datagram: Bytes,
    pub peer: SocketAddr,
    pub sent_at: Instant,
    /// Retransmissions performed so far.
    pub attempt: u32,
    pub next_fire: Instant,
    delay: Duration,
}

/// Action produced when the retransmission timer fires.
#[derive(Debug, Clone)]
pub enum TimeoutAction {
    /// Put the stored datagram back on the wire.
    Resend { datagram: Bytes, peer: SocketAddr },
    /// MAX_RETRANSMIT exhausted; the exchange is gone and its waiter must
    /// see a transmit timeout.
    Expire {
        message_id: MessageId,
        token: Token,
        attempts: u32,
    },
}

/// Per-session retransmission queue, keyed by message ID.
#[derive(Debug)]
pub struct RetransmitQueue {
    config: TransmissionConfig,
    entries: HashMap<MessageId, PendingExchange>,
}

impl RetransmitQueue {
    pub fn new(config: TransmissionConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Register a confirmable that was just written. The initial delay is
    /// drawn uniformly from `[ack_timeout, ack_timeout * ack_random_factor]`.
    pub fn register(
        &mut self,
        message_id: MessageId,
        token: Token,
        datagram: Bytes,
        peer: SocketAddr,
        now: Instant,
    ) {
        let low = self.config.ack_timeout;
        let high = low.mul_f64(self.config.ack_random_factor);
        let delay = if high > low {
            let span = (high - low).as_nanos() as u64;
            low + Duration::from_nanos(rand::thread_rng().gen_range(0..=span))
        } else {
            low
        };

        self.entries.insert(
            message_id,
            PendingExchange {
                message_id,
                token,
                datagram,
                peer,
                sent_at: now,
                attempt: 0,
                next_fire: now + delay,
                delay,
            },
        );
    }

    /// An ACK or RST with this message ID arrived: cancel the timer and
    /// hand the entry back so the caller can complete or fail its waiter.
    pub fn acknowledge(&mut self, message_id: MessageId) -> Option<PendingExchange> {
        self.entries.remove(&message_id)
    }

    /// Cancel by token (user cancellation of a request).
    pub fn cancel_token(&mut self, token: Token) -> Option<PendingExchange> {
        let message_id = self
            .entries
            .values()
            .find(|entry| entry.token == token)
            .map(|entry| entry.message_id)?;
        self.entries.remove(&message_id)
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.next_fire).min()
    }

    /// Process every entry whose deadline has passed. Each unexpired entry
    /// doubles its delay and is resent; entries past MAX_RETRANSMIT are
    /// removed and reported as expired.
    pub fn fire(&mut self, now: Instant) -> Vec<TimeoutAction> {
        let due: Vec<MessageId> = self
            .entries
            .values()
            .filter(|entry| entry.next_fire <= now)
            .map(|entry| entry.message_id)
            .collect();

        let mut actions = Vec::with_capacity(due.len());
        for message_id in due {
            let entry = self.entries.get_mut(&message_id).expect("due entry exists");
            if entry.attempt >= self.config.max_retransmit {
                let entry = self.entries.remove(&message_id).expect("entry exists");
                actions.push(TimeoutAction::Expire {
                    message_id,
                    token: entry.token,
                    attempts: entry.attempt,
                });
            } else {
                entry.attempt += 1;
                entry.delay *= 2;
                entry.next_fire = now + entry.delay;
                actions.push(TimeoutAction::Resend {
                    datagram: entry.datagram.clone(),
                    peer: entry.peer,
                });
            }
        }
        actions
    }

    /// Remove and return every entry (session shutdown).
    pub fn drain(&mut self) -> Vec<PendingExchange> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TransmissionConfig {
        // Factor 1.0 makes the initial delay deterministic.
        TransmissionConfig {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.0,
            max_retransmit: 4,
            nstart: 1,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn register_one(queue: &mut RetransmitQueue, now: Instant) {
        queue.register(
            0x30,
            Token::new(&[1, 2, 3, 4]).unwrap(),
            Bytes::from_static(b"datagram"),
            peer(),
            now,
        );
    }

    #[test]
    fn test_initial_delay_in_randomised_window() {
        let config = TransmissionConfig::default();
        let now = Instant::now();
        for _ in 0..32 {
            let mut queue = RetransmitQueue::new(config.clone());
            register_one(&mut queue, now);
            let deadline = queue.next_deadline().unwrap();
            assert!(deadline >= now + Duration::from_secs(2));
            assert!(deadline <= now + Duration::from_secs(3));
        }
    }

    #[test]
    fn test_ack_cancels_timer() {
        let mut queue = RetransmitQueue::new(test_config());
        register_one(&mut queue, Instant::now());
        let entry = queue.acknowledge(0x30).unwrap();
        assert_eq!(entry.token.as_bytes(), &[1, 2, 3, 4]);
        assert!(queue.next_deadline().is_none());
        assert!(queue.acknowledge(0x30).is_none());
    }

    #[test]
    fn test_backoff_doubles_and_expires() {
        let mut queue = RetransmitQueue::new(test_config());
        let start = Instant::now();
        register_one(&mut queue, start);

        // Deadlines land at 2, 6, 14, 30 and 62 seconds: delays of 2, 4,
        // 8, 16 and a final 32-second wait before expiry.
        let mut now = start;
        let mut resends = 0;
        loop {
            now = queue.next_deadline().unwrap();
            let actions = queue.fire(now);
            assert_eq!(actions.len(), 1);
            match &actions[0] {
                TimeoutAction::Resend { datagram, .. } => {
                    assert_eq!(datagram.as_ref(), b"datagram");
                    resends += 1;
                }
                TimeoutAction::Expire {
                    message_id,
                    attempts,
                    ..
                } => {
                    assert_eq!(*message_id, 0x30);
                    assert_eq!(*attempts, 4);
                    break;
                }
            }
        }
        assert_eq!(resends, 4);
        // Total elapsed is 2 + 4 + 8 + 16 + 32 = 62 seconds with factor 1.
        assert_eq!(now - start, Duration::from_secs(62));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fire_skips_future_entries() {
        let mut queue = RetransmitQueue::new(test_config());
        let now = Instant::now();
        register_one(&mut queue, now);
        assert!(queue.fire(now + Duration::from_secs(1)).is_empty());
        assert_eq!(queue.fire(now + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn test_cancel_by_token() {
        let mut queue = RetransmitQueue::new(test_config());
        register_one(&mut queue, Instant::now());
        let token = Token::new(&[1, 2, 3, 4]).unwrap();
        assert!(queue.cancel_token(token).is_some());
        assert!(queue.cancel_token(token).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_returns_everything() {
        let mut queue = RetransmitQueue::new(test_config());
        let now = Instant::now();
        for mid in 0..3u16 {
            queue.register(
                mid,
                Token::new(&[mid as u8]).unwrap(),
                Bytes::new(),
                peer(),
                now,
            );
        }
        assert_eq!(queue.drain().len(), 3);
        assert!(queue.is_empty());
    }
}
