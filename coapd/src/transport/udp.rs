//! UDP transport.
//!
//! One socket serves every peer: the listener demultiplexes inbound
//! datagrams by source address into per-peer connections, while sends go
//! straight out through the shared socket. Socket construction goes
//! through `socket2` for reuse-address and kernel buffer sizing.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Conn, Listener};
use crate::error::{Error, Result};

/// Datagrams buffered per accepted peer before the demultiplexer starts
/// dropping (the peer retransmits confirmables).
const PEER_QUEUE: usize = 128;

/// Create and configure a UDP socket.
///
/// Uses socket2 for fine-grained control: SO_REUSEADDR, optional kernel
/// buffer sizing, and non-blocking mode for the tokio reactor.
pub fn bind_udp_socket(
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
) -> std::io::Result<std::net::UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// Demultiplexing UDP listener: one socket, one accepted [`Conn`] per
/// distinct source address.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    closed: CancellationToken,
    recv_buf: Vec<u8>,
}

impl UdpListener {
    /// Bind a listener on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = bind_udp_socket(addr, None, None)?;
        let socket = UdpSocket::from_std(socket)?;
        debug!(addr = %socket.local_addr()?, "udp listener bound");
        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(Mutex::new(HashMap::new())),
            closed: CancellationToken::new(),
            recv_buf: vec![0u8; 64 * 1024],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Join a multicast group on the default interface.
    pub fn join_group(&self, group: IpAddr) -> Result<()> {
        match group {
            IpAddr::V4(addr) => self
                .socket
                .join_multicast_v4(addr, std::net::Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(addr) => self.socket.join_multicast_v6(&addr, 0)?,
        }
        Ok(())
    }

    /// Leave a multicast group.
    pub fn leave_group(&self, group: IpAddr) -> Result<()> {
        match group {
            IpAddr::V4(addr) => self
                .socket
                .leave_multicast_v4(addr, std::net::Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(addr) => self.socket.leave_multicast_v6(&addr, 0)?,
        }
        Ok(())
    }

    /// Send one datagram to a multicast group with the given hop limit.
    /// The group's address family must match the socket's.
    pub async fn send_multicast(
        &self,
        group: SocketAddr,
        hop_limit: u32,
        data: &[u8],
    ) -> Result<()> {
        let local = self.socket.local_addr()?;
        if local.is_ipv4() != group.is_ipv4() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "multicast group address family does not match socket",
            )));
        }
        // Hop limit control is only exposed for IPv4; IPv6 sends use the
        // OS default.
        if group.is_ipv4() {
            self.socket.set_multicast_ttl_v4(hop_limit)?;
        }
        self.socket.send_to(data, group).await?;
        Ok(())
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn accept(&mut self, cancel: &CancellationToken) -> Result<Box<dyn Conn>> {
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.closed.cancelled() => return Err(Error::Closed),
                received = self.socket.recv_from(&mut self.recv_buf) => received?,
            };
            let datagram = Bytes::copy_from_slice(&self.recv_buf[..len]);

            // Existing peer: forward into its session and keep accepting.
            let stale = {
                let peers = self.peers.lock().expect("peer map poisoned");
                match peers.get(&peer) {
                    Some(tx) => match tx.try_send(datagram.clone()) {
                        Ok(()) => continue,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(%peer, "peer queue full, dropping datagram");
                            continue;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => true,
                    },
                    None => false,
                }
            };
            if stale {
                self.peers.lock().expect("peer map poisoned").remove(&peer);
            }

            // New peer: hand out a demuxed connection seeded with this
            // first datagram.
            let (tx, rx) = mpsc::channel(PEER_QUEUE);
            tx.try_send(datagram).expect("fresh channel has capacity");
            self.peers
                .lock()
                .expect("peer map poisoned")
                .insert(peer, tx);
            debug!(%peer, "accepted udp peer");
            return Ok(Box::new(DemuxConn {
                socket: Arc::clone(&self.socket),
                peers: Arc::clone(&self.peers),
                peer,
                rx: tokio::sync::Mutex::new(rx),
                closed: CancellationToken::new(),
            }));
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Server-side per-peer connection over the shared socket.
struct DemuxConn {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    peer: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

#[async_trait]
impl Conn for DemuxConn {
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
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = self.socket.send_to(data, self.peer) => {
                sent?;
                Ok(())
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.closed.cancel();
        self.peers
            .lock()
            .expect("peer map poisoned")
            .remove(&self.peer);
    }
}

/// Client-side connected UDP socket.
pub struct UdpConn {
    socket: UdpSocket,
    peer: SocketAddr,
    closed: CancellationToken,
}

impl UdpConn {
    /// Bind an ephemeral local socket and connect it to `peer`.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid any-address")
        } else {
            "[::]:0".parse().expect("valid any-address")
        };
        let socket = bind_udp_socket(bind_addr, None, None)?;
        let socket = UdpSocket::from_std(socket)?;
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            peer,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Conn for UdpConn {
    async fn recv(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.closed.cancelled() => Err(Error::Closed),
            received = self.socket.recv(buf) => Ok(received?),
        }
    }

    async fn send(&self, data: &[u8], cancel: &CancellationToken) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = self.socket.send(data) => {
                sent?;
                Ok(())
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_server_datagram_roundtrip() {
        let mut listener = UdpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let client = UdpConn::connect(server_addr).await.unwrap();
        client.send(b"hello", &cancel).await.unwrap();

        let conn = listener.accept(&cancel).await.unwrap();
        let mut buf = [0u8; 64];
        let len = conn.recv(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..len], b"hello");

        conn.send(b"world", &cancel).await.unwrap();
        let len = client.recv(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..len], b"world");
    }

    #[tokio::test]
    async fn test_accept_routes_existing_peer_traffic() {
        let mut listener = UdpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let client = UdpConn::connect(server_addr).await.unwrap();
        client.send(b"one", &cancel).await.unwrap();
        let conn = listener.accept(&cancel).await.unwrap();

        // A second datagram from the same peer must be routed to the same
        // conn while the accept loop keeps running, not produce a new
        // accept.
        client.send(b"two", &cancel).await.unwrap();
        let pumped = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            listener.accept(&cancel),
        )
        .await;
        assert!(pumped.is_err(), "same peer must not be accepted twice");

        let mut buf = [0u8; 64];
        let len = conn.recv(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..len], b"one");
        let len = conn.recv(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..len], b"two");
    }

    #[tokio::test]
    async fn test_cancelled_recv_returns_cancelled() {
        let server_addr = {
            let listener = UdpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            listener.local_addr().unwrap()
        };
        let client = UdpConn::connect(server_addr).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut buf = [0u8; 16];
        assert!(matches!(
            client.recv(&mut buf, &cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_closed_conn_fails_sends() {
        let listener = UdpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = UdpConn::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        client.close();
        let cancel = CancellationToken::new();
        assert!(matches!(
            client.send(b"x", &cancel).await,
            Err(Error::Closed)
        ));
    }
}
