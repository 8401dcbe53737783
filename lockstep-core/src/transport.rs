//! UDP transport primitives.
//!
//! Thin wrappers over `tokio::net::UdpSocket`:
//!
//! - unbound sockets and fixed-port rendezvous sockets,
//! - [`PeerSocket`], a socket connected to exactly one peer so the
//!   kernel drops datagrams from anyone else,
//! - [`recv_any`], a bounded wait for the first of several sockets to
//!   produce a datagram.
//!
//! A zero timeout means "poll": the caller yields once so the I/O driver
//! can publish readiness, then checks without blocking.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures::future::select_all;
use tokio::net::UdpSocket;

use crate::error::SyncError;

// ── Socket creation ──────────────────────────────────────────────

/// Bind an ephemeral socket in the same address family as `peer`.
pub async fn udp_socket_for(peer: &SocketAddr) -> Result<UdpSocket, SyncError> {
    let any: IpAddr = match peer {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    Ok(UdpSocket::bind(SocketAddr::new(any, 0)).await?)
}

/// Bind a socket on every IPv4 interface at `port` (0 picks one).
pub async fn udp_listener_on(port: u16) -> Result<UdpSocket, SyncError> {
    Ok(UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?)
}

// ── Receiving ────────────────────────────────────────────────────

/// One datagram taken from the socket at `index` of a [`recv_any`] set.
#[derive(Debug)]
pub struct Received {
    pub index: usize,
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// Wait until one of `sockets` yields a datagram, or `timeout` passes.
///
/// Only the winning socket consumes a datagram; `recv_from` is cancel
/// safe so the others are left untouched.
pub async fn recv_any(
    sockets: &[&UdpSocket],
    max_size: usize,
    timeout: Duration,
) -> Result<Received, SyncError> {
    if sockets.is_empty() {
        return Err(SyncError::InvalidState("no sockets to wait on"));
    }
    if timeout.is_zero() {
        tokio::task::yield_now().await;
    }

    let waits = sockets.iter().map(|socket| {
        Box::pin(async move {
            let mut buf = vec![0u8; max_size];
            let (len, from) = socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok::<_, std::io::Error>((buf, from))
        })
    });

    match tokio::time::timeout(timeout, select_all(waits)).await {
        Ok((Ok((data, from)), index, _)) => Ok(Received { index, data, from }),
        Ok((Err(e), _, _)) => Err(SyncError::Io(e)),
        Err(_) => Err(SyncError::Timeout(timeout)),
    }
}

/// [`recv_any`] over a single socket.
pub async fn recv_from_timeout(
    socket: &UdpSocket,
    max_size: usize,
    timeout: Duration,
) -> Result<(Vec<u8>, SocketAddr), SyncError> {
    let received = recv_any(&[socket], max_size, timeout).await?;
    Ok((received.data, received.from))
}

// ── PeerSocket ───────────────────────────────────────────────────

/// A UDP socket fixed to a single remote peer.
#[derive(Debug)]
pub struct PeerSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    max_packet_size: usize,
}

impl PeerSocket {
    /// Connect `socket` to `peer`; subsequent receives only see `peer`.
    pub async fn connect(
        socket: UdpSocket,
        peer: SocketAddr,
        max_packet_size: usize,
    ) -> Result<Self, SyncError> {
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            peer,
            max_packet_size,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SyncError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram. Errors are returned raw so the owner can decide
    /// whether they mean the peer went away.
    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        self.socket.send(data).await.map(|_| ())
    }

    /// Receive one datagram from the peer within `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, SyncError> {
        recv_from_timeout(&self.socket, self.max_packet_size, timeout)
            .await
            .map(|(data, _)| data)
    }
}

// ── Tests ────────────────────────────────────────────────────────
