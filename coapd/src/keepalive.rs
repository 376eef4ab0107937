//! Session keepalive: periodic empty-CON probes.
//!
//! Runs as a companion task next to each session worker. A probe is
//! answered by the peer's Reset (or ACK); after `max_retries` consecutive
//! failures the session is closed.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::KeepaliveConfig;
use crate::session::Session;

/// Keepalive prober for one session.
pub struct KeepAlive {
    interval: Duration,
    max_retries: u32,
}

impl KeepAlive {
    /// Build from configuration; `None` when keepalive is disabled.
    pub fn from_config(config: &KeepaliveConfig) -> Option<Self> {
        config.interval.map(|interval| Self {
            interval,
            max_retries: config.max_retries.max(1),
        })
    }

    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries: max_retries.max(1),
        }
    }

    /// Probe until the session ends or the peer stops answering.
    pub async fn run(&self, session: Session) {
        let cancel = session.cancelled();
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match session.ping(&cancel).await {
                Ok(()) => {
                    failures = 0;
                }
                Err(crate::Error::Cancelled) | Err(crate::Error::Closed) => return,
                Err(err) => {
                    failures += 1;
                    debug!(peer = %session.peer_addr(), failures, error = %err, "keepalive probe failed");
                    if failures >= self.max_retries {
                        warn!(peer = %session.peer_addr(), "keepalive exhausted, closing session");
                        session.close();
                        return;
                    }
                }
            }
        }
    }
}
