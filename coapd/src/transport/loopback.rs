//! In-memory loopback transport.
//!
//! A pair of connections wired back to back over bounded channels, plus a
//! rendezvous listener, letting the whole endpoint stack run without a
//! socket. Used heavily by the integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Conn, Listener};
use crate::error::{Error, Result};

/// Datagrams buffered per direction.
const QUEUE: usize = 256;

static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

fn fresh_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// One endpoint of an in-memory flow.
pub struct LoopbackConn {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    local: SocketAddr,
    peer: SocketAddr,
    closed: CancellationToken,
}

/// Create a connected pair of loopback endpoints with distinct fake
/// addresses.
pub fn pair() -> (LoopbackConn, LoopbackConn) {
    let (a_addr, b_addr) = (fresh_addr(), fresh_addr());
    let (a_tx, b_rx) = mpsc::channel(QUEUE);
    let (b_tx, a_rx) = mpsc::channel(QUEUE);
    (
        LoopbackConn {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            local: a_addr,
            peer: b_addr,
            closed: CancellationToken::new(),
        },
        LoopbackConn {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            local: b_addr,
            peer: a_addr,
            closed: CancellationToken::new(),
        },
    )
}

impl LoopbackConn {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Conn for LoopbackConn {
    async fn recv(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.closed.cancelled() => Err(Error::Closed),
            datagram = rx.recv() => match datagram {
                Some(datagram) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok(len)
                }
                None => Err(Error::Closed),
            },
        }
    }

    async fn send(&self, data: &[u8], cancel: &CancellationToken) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let datagram = Bytes::copy_from_slice(data);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = self.tx.send(datagram) => sent.map_err(|_| Error::Closed),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Rendezvous listener: `connect` on the dialer yields the client end and
/// queues the server end for `accept`.
pub struct LoopbackListener {
    incoming: mpsc::Receiver<LoopbackConn>,
    closed: CancellationToken,
}

/// Dialer half of [`listener`].
#[derive(Clone)]
pub struct LoopbackDialer {
    tx: mpsc::Sender<LoopbackConn>,
}

/// Create a listener and its dialer.
pub fn listener() -> (LoopbackListener, LoopbackDialer) {
    let (tx, incoming) = mpsc::channel(16);
    (
        LoopbackListener {
            incoming,
            closed: CancellationToken::new(),
        },
        LoopbackDialer { tx },
    )
}

impl LoopbackDialer {
    /// Establish a new flow, returning the client end.
    pub async fn connect(&self) -> Result<LoopbackConn> {
        let (client, server) = pair();
        self.tx.send(server).await.map_err(|_| Error::Closed)?;
        Ok(client)
    }
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&mut self, cancel: &CancellationToken) -> Result<Box<dyn Conn>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.closed.cancelled() => Err(Error::Closed),
            conn = self.incoming.recv() => match conn {
                Some(conn) => Ok(Box::new(conn) as Box<dyn Conn>),
                None => Err(Error::Closed),
            },
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_datagrams_both_ways() {
        let (a, b) = pair();
        let cancel = CancellationToken::new();
        a.send(b"ping", &cancel).await.unwrap();
        b.send(b"pong", &cancel).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf, &cancel).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(a.recv(&mut buf, &cancel).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"pong");
        assert_eq!(a.peer_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_flow() {
        let (a, b) = pair();
        drop(b);
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 16];
        assert!(matches!(
            a.recv(&mut buf, &cancel).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_listener_rendezvous() {
        let (mut listener, dialer) = listener();
        let cancel = CancellationToken::new();

        let client = dialer.connect().await.unwrap();
        let server = listener.accept(&cancel).await.unwrap();

        client.send(b"hello", &cancel).await.unwrap();
        let mut buf = [0u8; 16];
        let len = server.recv(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(server.peer_addr(), client.local_addr());
    }
}
