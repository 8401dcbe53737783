//! The joining side of admission.
//!
//! After the welcome, the connector opens one socket per seated host
//! and reports their ports. It is in the network once every one of
//! those sockets has heard from its host; the first datagram on each
//! carries that host's iteration count, and the highest one becomes the
//! local starting point.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::codec::Value;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::events::SessionEvents;
use crate::frame::{Frame, Identification};
use crate::host::{Host, RemoteHost};
use crate::state::ConnectionPhase;
use crate::transport::{self, PeerSocket};

/// A per-host socket waiting for its host to connect back.
#[derive(Debug)]
struct PendingPeer {
    host: Host,
    socket: UdpSocket,
}

#[derive(Debug)]
pub(crate) struct Connector {
    address: SocketAddr,
    phase: ConnectionPhase,
    /// Connected to the listener's negotiation socket after the welcome.
    handshake: Option<UdpSocket>,
    pending_peers: Vec<PendingPeer>,
    publicized_data: Option<Value>,
    ports_packet: Vec<u8>,
}

impl Connector {
    pub(crate) fn new(address: SocketAddr) -> Self {
        Self {
            address,
            phase: ConnectionPhase::Idle,
            handshake: None,
            pending_peers: Vec::new(),
            publicized_data: None,
            ports_packet: Vec::new(),
        }
    }

    pub(crate) fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub(crate) fn publicized_data(&self) -> Result<&Value, SyncError> {
        self.publicized_data
            .as_ref()
            .ok_or(SyncError::NoPublicizedData)
    }

    /// Ask the listener for admission. Blocks for at most
    /// `attempt_count` handshake timeouts.
    pub(crate) async fn start<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        self.phase.begin_connecting()?;
        match self.request_admission(engine).await {
            Ok(()) => {
                engine.set_accepting_peers(true);
                Ok(())
            }
            Err(e) => {
                if e.is_protocol_violation() {
                    engine.events_mut().protocol_violation(&e);
                }
                self.reset();
                Err(e)
            }
        }
    }

    pub(crate) async fn update<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        match self.phase {
            ConnectionPhase::Connecting => self.attempt_connecting(engine).await,
            ConnectionPhase::Syncing { .. } => engine.sync_actions().await,
            _ => Err(SyncError::InvalidState(
                "connector has not started connecting",
            )),
        }
    }

    /// Stop executing admissions of further peers.
    pub(crate) fn stop<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        if !self.phase.is_syncing() {
            return Err(SyncError::InvalidState(
                "cannot stop connecting before joining the network",
            ));
        }
        engine.set_accepting_peers(false);
        debug!(
            iteration = engine.iteration_count(),
            "stopped accepting peers on this host only"
        );
        Ok(())
    }

    fn reset(&mut self) {
        self.phase.abort();
        self.handshake = None;
        self.pending_peers.clear();
    }

    async fn request_admission<E: SessionEvents>(
        &mut self,
        engine: &SyncEngine<E>,
    ) -> Result<(), SyncError> {
        let config = engine.config().clone();
        let local = engine.local_host();
        let request = Identification {
            protocol_version: config.protocol_version,
            host_id: local.id,
            host_name: local.name.clone(),
        }
        .encode()?;

        let socket = transport::udp_socket_for(&self.address).await?;
        info!(listener = %self.address, "requesting admission");
        for attempt in 1..=config.attempt_count {
            socket.send_to(&request, self.address).await?;
            let (data, from) = match transport::recv_from_timeout(
                &socket,
                config.max_packet_size,
                config.handshake_timeout(),
            )
            .await
            {
                Ok(received) => received,
                Err(e) if e.is_recoverable() || matches!(e, SyncError::Io(_)) => {
                    debug!(attempt, error = %e, "no answer from listener");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match Frame::decode(&data)? {
                Frame::NotConnecting => {
                    return Err(SyncError::ConnectionFailed(format!(
                        "{} declined the connection",
                        self.address
                    )));
                }
                Frame::Welcome {
                    publicized_data,
                    hosts,
                } => {
                    socket.connect(from).await?;
                    return self.accept_welcome(socket, publicized_data, hosts).await;
                }
                other => {
                    return Err(SyncError::ProtocolViolation(format!(
                        "expected a welcome, got {other}"
                    )));
                }
            }
        }
        Err(SyncError::ConnectionFailed(format!(
            "no answer from {} after {} attempts",
            self.address, config.attempt_count
        )))
    }

    async fn accept_welcome(
        &mut self,
        handshake: UdpSocket,
        publicized_data: Value,
        hosts: Vec<Host>,
    ) -> Result<(), SyncError> {
        let mut ports = Vec::with_capacity(hosts.len());
        let mut pending = Vec::with_capacity(hosts.len());
        for host in hosts {
            let socket = transport::udp_socket_for(&self.address).await?;
            ports.push(socket.local_addr()?.port());
            pending.push(PendingPeer { host, socket });
        }
        self.ports_packet = Frame::ListeningOn { ports }.encode()?;
        handshake.send(&self.ports_packet).await?;
        info!(hosts = pending.len(), "welcomed, waiting for hosts to connect back");

        self.publicized_data = Some(publicized_data);
        self.pending_peers = pending;
        self.handshake = Some(handshake);
        Ok(())
    }

    async fn attempt_connecting<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        let max_packet_size = engine.config().max_packet_size;
        if let Some(handshake) = &self.handshake {
            match transport::recv_from_timeout(handshake, max_packet_size, Duration::ZERO).await {
                Ok((data, _)) => return self.handle_listener_frame(&data).await,
                Err(SyncError::Timeout(_)) => {}
                Err(SyncError::Io(e)) => self.close_handshake(&e),
                Err(e) => return Err(e),
            }
        }

        let received = {
            let sockets: Vec<&UdpSocket> = self.pending_peers.iter().map(|p| &p.socket).collect();
            if sockets.is_empty() {
                return Err(SyncError::InvalidState("no hosts left to connect back"));
            }
            match transport::recv_any(&sockets, max_packet_size, Duration::ZERO).await {
                Ok(received) => received,
                Err(SyncError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        engine.events_mut().got_first_connection();
        let first = self.pending_peers.remove(received.index);
        let mut iteration = Self::admit(engine, first, &received.data, received.from).await?;

        let admission_timeout = engine.config().admission_timeout();
        while !self.pending_peers.is_empty() {
            let received = {
                let sockets: Vec<&UdpSocket> = self.pending_peers.iter().map(|p| &p.socket).collect();
                match transport::recv_any(&sockets, max_packet_size, admission_timeout).await {
                    Ok(received) => received,
                    Err(SyncError::Timeout(_)) => {
                        return Err(SyncError::ConnectionFailed(format!(
                            "{} hosts never connected back",
                            self.pending_peers.len()
                        )));
                    }
                    Err(e) => return Err(e),
                }
            };
            let peer = self.pending_peers.remove(received.index);
            let executed = Self::admit(engine, peer, &received.data, received.from).await?;
            iteration = iteration.max(executed);
        }

        engine.set_iteration_count(iteration);
        self.handshake = None;
        self.phase.join()?;
        info!(iteration, hosts = engine.host_ids().len(), "joined the network");
        engine.events_mut().in_network();
        Ok(())
    }

    /// The listener drops its negotiation socket once it has the port
    /// list, so a failure here only means the exchange is over.
    fn close_handshake(&mut self, e: &std::io::Error) {
        debug!(error = %e, "negotiation socket closed by the listener");
        self.handshake = None;
    }

    async fn handle_listener_frame(&mut self, data: &[u8]) -> Result<(), SyncError> {
        match Frame::decode(data)? {
            Frame::Welcome { .. } => {
                debug!("welcome repeated, resending port list");
                let sent = match &self.handshake {
                    Some(handshake) => handshake.send(&self.ports_packet).await.map(|_| ()),
                    None => Ok(()),
                };
                if let Err(e) = sent {
                    self.close_handshake(&e);
                }
                Ok(())
            }
            Frame::NotConnecting => {
                self.reset();
                Err(SyncError::ConnectionFailed(
                    "listener stopped accepting connections".into(),
                ))
            }
            other => Err(SyncError::ProtocolViolation(format!(
                "unexpected {other} during admission"
            ))),
        }
    }

    /// Bind `peer` to the host that just connected back and return the
    /// iteration count it reported.
    async fn admit<E: SessionEvents>(
        engine: &mut SyncEngine<E>,
        peer: PendingPeer,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<u64, SyncError> {
        let executed = match Frame::decode(data)? {
            Frame::Actions { executed, .. } => executed,
            other => {
                return Err(SyncError::ProtocolViolation(format!(
                    "{} connected back with {other}",
                    peer.host
                )));
            }
        };
        let socket = PeerSocket::connect(peer.socket, from, engine.config().max_packet_size).await?;
        debug!(host = %peer.host, executed, "host connected back");
        engine.add_remote(RemoteHost::new(peer.host, socket, engine.config().recv_timeout()))?;
        Ok(executed)
    }
}
