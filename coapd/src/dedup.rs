//! Deduplication of received confirmables (RFC 7252 Section 4.5).
//!
//! Remembers `(remote, message_id)` pairs for EXCHANGE_LIFETIME so a
//! retransmitted CON neither reaches the handler twice nor goes without
//! its (identical) reply. Eviction is amortised over inserts; no timer
//! task is needed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

use bytes::Bytes;
use coapd_msg::MessageId;

/// Result of checking an inbound confirmable against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; dispatch normally.
    New,
    /// Seen before and the exchange already produced a reply: resend these
    /// bytes, do not dispatch.
    Replay(Bytes),
    /// Seen before but the handler has not replied yet: drop silently.
    InFlight,
}

#[derive(Debug)]
struct DedupEntry {
    inserted_at: Instant,
    response: Option<Bytes>,
}

/// Per-session cache of recently seen confirmables.
#[derive(Debug)]
pub struct DedupCache {
    lifetime: Duration,
    entries: HashMap<(SocketAddr, MessageId), DedupEntry>,
    last_sweep: Option<Instant>,
}

impl DedupCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            entries: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Record an inbound CON and classify it.
    pub fn observe(&mut self, peer: SocketAddr, message_id: MessageId, now: Instant) -> DedupOutcome {
        self.sweep(now);
        match self.entries.get(&(peer, message_id)) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.lifetime => {
                match &entry.response {
                    Some(bytes) => DedupOutcome::Replay(bytes.clone()),
                    None => DedupOutcome::InFlight,
                }
            }
            _ => {
                self.entries.insert(
                    (peer, message_id),
                    DedupEntry {
                        inserted_at: now,
                        response: None,
                    },
                );
                DedupOutcome::New
            }
        }
    }

    /// Attach the reply bytes produced for an exchange, enabling replay
    /// for later duplicates.
    pub fn store_response(&mut self, peer: SocketAddr, message_id: MessageId, datagram: Bytes) {
        if let Some(entry) = self.entries.get_mut(&(peer, message_id)) {
            entry.response = Some(datagram);
        }
    }

    /// Drop entries older than EXCHANGE_LIFETIME. Runs at most once per
    /// second; each observe() call pays for it.
    fn sweep(&mut self, now: Instant) {
        const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
        if let Some(last) = self.last_sweep {
            if now.duration_since(last) < SWEEP_INTERVAL {
                return;
            }
        }
        self.last_sweep = Some(now);
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted_at) < lifetime);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
