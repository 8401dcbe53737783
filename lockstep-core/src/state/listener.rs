//! The rendezvous side of admission.
//!
//! ```text
//!  connector                        listener
//!      │ ── (version, id, name) ──►     │  rendezvous socket
//!      │ ◄── WELCOME! ─────────────     │  fresh socket, repeated per tick
//!      │ ── listening_on [ports] ──►    │
//!      │                                │  ConnectTo scheduled on every host
//!      │ ◄══ Actions (per host) ═══     │  at the scheduled iteration
//! ```
//!
//! Every step runs inside a normal sync tick, so the session keeps
//! iterating while a newcomer is negotiated.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::action::InternalAction;
use crate::codec::Value;
use crate::engine::{Admission, SyncEngine};
use crate::error::SyncError;
use crate::events::SessionEvents;
use crate::frame::{Frame, Identification};
use crate::host::{Host, HostId};
use crate::state::ConnectionPhase;
use crate::transport::{self, PeerSocket};

/// A requester that has been welcomed but has not sent its ports yet.
#[derive(Debug)]
struct PendingConnection {
    host: Host,
    address: SocketAddr,
    socket: PeerSocket,
    welcome: Vec<u8>,
    /// Hosts listed in the welcome, in the order the ports will follow.
    welcomed: Vec<HostId>,
    attempts: u32,
}

impl PendingConnection {
    /// Send the welcome once more and wait for the port list.
    async fn exchange(&mut self, timeout: Duration) -> Result<Vec<u8>, SyncError> {
        self.attempts += 1;
        self.socket.send(&self.welcome).await?;
        self.socket.recv(timeout).await
    }
}

#[derive(Debug)]
pub(crate) struct Listener {
    port: u16,
    phase: ConnectionPhase,
    publicized_data: Value,
    socket: Option<UdpSocket>,
    pending: Option<PendingConnection>,
    /// Rendezvous addresses that were already admitted; their requests
    /// are stale retransmissions.
    admitted: Vec<SocketAddr>,
}

impl Listener {
    pub(crate) fn new(port: u16, publicized_data: Value) -> Self {
        Self {
            port,
            phase: ConnectionPhase::Idle,
            publicized_data,
            socket: None,
            pending: None,
            admitted: Vec::new(),
        }
    }

    pub(crate) fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub(crate) fn publicized_data(&self) -> &Value {
        &self.publicized_data
    }

    pub(crate) fn rendezvous_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the rendezvous port and start accepting requests.
    pub(crate) async fn start<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        if !self.phase.is_idle() {
            return Err(SyncError::InvalidState("listener already started"));
        }
        let socket = transport::udp_listener_on(self.port).await?;
        info!(addr = ?socket.local_addr().ok(), "listening for connectors");
        self.socket = Some(socket);
        engine.set_accepting_peers(true);
        self.phase.start_listening()
    }

    pub(crate) async fn update<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        match self.phase {
            ConnectionPhase::Listening => self.attempt_listening(engine).await,
            ConnectionPhase::Negotiating => self.send_welcome(engine).await,
            ConnectionPhase::Syncing { .. } => engine.sync_actions().await,
            _ => Err(SyncError::InvalidState(
                "listener has not started connecting",
            )),
        }
    }

    /// Decline any pending requester, close the rendezvous socket and
    /// keep running as a plain host.
    pub(crate) async fn stop<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        engine.set_accepting_peers(false);
        debug!(
            iteration = engine.iteration_count(),
            "stopped accepting peers on this host only"
        );
        if let Some(pending) = self.pending.take() {
            info!(host = %pending.host, "declining pending connector");
            let packet = Frame::NotConnecting.encode()?;
            if let Err(e) = pending.socket.send(&packet).await {
                debug!(error = %e, "decline was not delivered");
            }
        }
        self.socket = None;
        self.phase.stop_listening()
    }

    /// Follow-up for every `ConnectTo` this host executed during the tick.
    pub(crate) fn complete_admissions<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
        admissions: Vec<Admission>,
    ) {
        for admission in admissions {
            if !self.admitted.contains(&admission.original_address) {
                self.admitted.push(admission.original_address);
            }
            engine.run_internal_on_all(InternalAction::ResetRandomSeed);
            info!(host = %admission.host, "now hosting");
            engine.events_mut().hosting_new_host(&admission.host);
        }
    }

    async fn attempt_listening<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        engine.sync_actions().await?;

        let Some(rendezvous) = &self.socket else {
            return Err(SyncError::InvalidState("rendezvous socket is closed"));
        };
        let max_packet_size = engine.config().max_packet_size;
        let (data, from) =
            match transport::recv_from_timeout(rendezvous, max_packet_size, Duration::ZERO).await {
                Ok(received) => received,
                Err(SyncError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

        let request = Identification::decode(&data)?;
        let local = engine.config().protocol_version;
        if request.protocol_version != local {
            let decline = Frame::NotConnecting.encode()?;
            rendezvous.send_to(&decline, from).await?;
            let err = SyncError::VersionMismatch {
                local,
                remote: request.protocol_version,
            };
            warn!(%from, error = %err, "rejected connector");
            engine.events_mut().protocol_violation(&err);
            return Err(err);
        }
        if self.admitted.contains(&from) {
            debug!(%from, "repeated request from an admitted connector");
            return Ok(());
        }

        let host = Host::new(request.host_id, request.host_name);
        info!(%host, %from, "connection request");
        engine.events_mut().new_connector(&host.name, from);

        let socket = transport::udp_socket_for(&from).await?;
        let socket = PeerSocket::connect(socket, from, max_packet_size).await?;
        let hosts: Vec<Host> = engine.hosts().cloned().collect();
        let welcomed = hosts.iter().map(|h| h.id).collect();
        let welcome = Frame::Welcome {
            publicized_data: self.publicized_data.clone(),
            hosts,
        }
        .encode()?;

        self.pending = Some(PendingConnection {
            host,
            address: from,
            socket,
            welcome,
            welcomed,
            attempts: 0,
        });
        self.phase.begin_negotiation()
    }

    async fn send_welcome<E: SessionEvents>(
        &mut self,
        engine: &mut SyncEngine<E>,
    ) -> Result<(), SyncError> {
        engine.sync_actions().await?;

        let timeout = engine.config().handshake_timeout();
        let attempt_count = engine.config().attempt_count;
        let Some(pending) = self.pending.as_mut() else {
            return self.phase.end_negotiation();
        };

        let data = match pending.exchange(timeout).await {
            Ok(data) => data,
            Err(e) if pending.attempts < attempt_count => {
                debug!(host = %pending.host, attempt = pending.attempts, error = %e, "no port list yet");
                return Ok(());
            }
            Err(e) => {
                warn!(host = %pending.host, attempts = pending.attempts, error = %e, "connector went quiet, giving up");
                self.pending = None;
                return self.phase.end_negotiation();
            }
        };

        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.phase.end_negotiation()?;

        let ports = match Frame::decode(&data) {
            Ok(Frame::ListeningOn { ports }) if ports.len() == pending.welcomed.len() => ports,
            Ok(other) => {
                let err = SyncError::ProtocolViolation(format!(
                    "{} answered the welcome with {other}",
                    pending.host
                ));
                engine.events_mut().protocol_violation(&err);
                return Err(err);
            }
            Err(e) => {
                engine.events_mut().protocol_violation(&e);
                return Err(e);
            }
        };
        engine
            .events_mut()
            .connector_ready(&pending.host.name, pending.address);

        for (id, port) in pending.welcomed.iter().zip(ports) {
            if engine.host(*id).is_none() {
                warn!(host = id, "welcomed host left before admission");
                continue;
            }
            engine.run_internal_on(
                *id,
                InternalAction::ConnectTo {
                    remote_id: pending.host.id,
                    remote_name: pending.host.name.clone(),
                    original_address: pending.address,
                    address: SocketAddr::new(pending.address.ip(), port),
                },
            )?;
        }
        // Recorded now so a retransmitted request is not negotiated twice
        // while the admission is in flight.
        self.admitted.push(pending.address);
        info!(host = %pending.host, "admission scheduled");
        Ok(())
    }
}
