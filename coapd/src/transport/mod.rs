//! Transport abstraction.
//!
//! Sessions speak to a [`Conn`] capability and servers accept from a
//! [`Listener`]; UDP, DTLS-over-UDP or the in-memory loopback plug in
//! behind these traits without the session or codec ever naming a
//! concrete socket type. Waits take a cancellation token instead of
//! socket deadlines.

pub mod loopback;
pub mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One bidirectional datagram flow to a single remote endpoint.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Receive the next datagram into `buf`, returning its length.
    ///
    /// Cancelling aborts the wait with [`crate::Error::Cancelled`]; a
    /// closed flow yields [`crate::Error::Closed`].
    async fn recv(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize>;

    /// Send one datagram.
    async fn send(&self, data: &[u8], cancel: &CancellationToken) -> Result<()>;

    /// The remote endpoint of this flow.
    fn peer_addr(&self) -> SocketAddr;

    /// Tear the flow down; subsequent operations fail with `Closed`.
    fn close(&self);
}

/// Source of accepted connections (a demultiplexing UDP socket, a DTLS
/// acceptor, a loopback rendezvous).
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next connection.
    async fn accept(&mut self, cancel: &CancellationToken) -> Result<Box<dyn Conn>>;

    /// Stop accepting; pending and future accepts fail with `Closed`.
    fn close(&self);
}
