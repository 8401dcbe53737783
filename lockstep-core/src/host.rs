//! Participants of a session and their per-iteration action queues.
//!
//! | Type         | Role                                                   |
//! |--------------|--------------------------------------------------------|
//! | `Host`       | Identity: random 32-bit id plus display name           |
//! | `LocalHost`  | This process; actions move through an in-memory queue |
//! | `RemoteHost` | A peer behind its own connected UDP socket             |
//! | `Peer`       | Either of the above, as stored by the engine           |
//!
//! A remote host keeps every action it promised the peer (`tx`) until
//! the peer reports having executed past it, and resends the whole
//! backlog each time. Any single datagram that gets through is enough
//! for the peer to catch up.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::error::SyncError;
use crate::frame::{Backlog, Frame};
use crate::transport::PeerSocket;

pub type HostId = u32;

/// Socket errors in a row, within one receive window, before the rest of
/// the window is slept out.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

// ── Host ─────────────────────────────────────────────────────────

/// Identity of a participant. Equality, hashing and ordering use the id
/// only, so every peer enumerates hosts in the same order.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub name: String,
}

impl Host {
    pub fn new(id: HostId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Host {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Host {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#010x})", self.name, self.id)
    }
}

// ── LocalHost ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LocalHost {
    host: Host,
    queue: BTreeMap<u64, Vec<Action>>,
}

impl LocalHost {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            queue: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Commit `actions` for `scheduled`. A slot that is already filled
    /// keeps its first contents.
    pub fn send_actions(&mut self, scheduled: u64, actions: Vec<Action>) {
        self.queue.entry(scheduled).or_insert(actions);
    }

    pub fn recv_actions(&mut self, iteration: u64) -> Vec<Action> {
        self.queue.remove(&iteration).unwrap_or_default()
    }
}

// ── RemoteHost ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct RemoteHost {
    host: Host,
    socket: PeerSocket,
    recv_timeout: Duration,
    /// Promised to the peer, not yet confirmed executed.
    tx: Backlog,
    /// Received from the peer, not yet consumed.
    rx: Backlog,
    /// Iterations we promised something for and have not consumed yet.
    /// An iteration missing here was skipped by a latency increase.
    scheduled: BTreeSet<u64>,
    last_sent: Option<Vec<u8>>,
    disconnected: bool,
    disconnect_reported: bool,
    /// Set by a goodbye: the peer contributes nothing after this one.
    departs_after: Option<u64>,
}

impl RemoteHost {
    pub fn new(host: Host, socket: PeerSocket, recv_timeout: Duration) -> Self {
        Self {
            host,
            socket,
            recv_timeout,
            tx: Backlog::new(),
            rx: Backlog::new(),
            scheduled: BTreeSet::new(),
            last_sent: None,
            disconnected: false,
            disconnect_reported: false,
            departs_after: None,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn address(&self) -> SocketAddr {
        self.socket.peer_addr()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Last iteration the peer announced it will take part in.
    pub fn departs_after(&self) -> Option<u64> {
        self.departs_after
    }

    /// Whether the peer said goodbye before `iteration`.
    pub fn has_departed_before(&self, iteration: u64) -> bool {
        self.departs_after.is_some_and(|last| last < iteration)
    }

    /// Returns `true` once per failure streak: after the socket first
    /// fails, and again only if the peer came back in between.
    pub(crate) fn take_disconnect_notice(&mut self) -> bool {
        if self.disconnected && !self.disconnect_reported {
            self.disconnect_reported = true;
            return true;
        }
        false
    }

    /// Add `actions` to the backlog for `scheduled` (first write wins) and
    /// transmit the whole backlog together with `executed`, the iteration
    /// this process is about to execute.
    pub async fn send_actions(
        &mut self,
        scheduled: u64,
        executed: u64,
        actions: Vec<Action>,
    ) -> Result<(), SyncError> {
        self.scheduled.insert(scheduled);
        self.tx.entry(scheduled).or_insert(actions);
        let packet = Frame::Actions {
            executed,
            backlog: self.tx.clone(),
        }
        .encode()?;
        self.transmit(&packet).await;
        self.last_sent = Some(packet);
        Ok(())
    }

    /// Send the last packet again. Skipped once the peer said goodbye or
    /// its socket failed; a datagram from the peer re-enables resends.
    pub async fn resend_actions(&mut self) {
        if self.departs_after.is_some() || self.disconnected {
            return;
        }
        if let Some(packet) = self.last_sent.take() {
            self.transmit(&packet).await;
            self.last_sent = Some(packet);
        }
    }

    /// Announce departure: nothing will be scheduled after
    /// `last_scheduled`. The remaining backlog rides along.
    pub async fn send_goodbye(
        &mut self,
        executed: u64,
        last_scheduled: u64,
        repeats: u32,
    ) -> Result<(), SyncError> {
        let packet = Frame::Goodbye {
            executed,
            last_scheduled,
            backlog: self.tx.clone(),
        }
        .encode()?;
        for _ in 0..repeats.max(1) {
            self.transmit(&packet).await;
        }
        Ok(())
    }

    /// The peer's actions for `iteration`.
    ///
    /// Returns immediately with nothing when the iteration was never
    /// scheduled for this peer, or the peer has left. Otherwise pumps the
    /// socket until the entry arrives; a timeout is returned to the caller.
    pub async fn recv_actions(&mut self, iteration: u64) -> Result<Vec<Action>, SyncError> {
        if !self.scheduled.contains(&iteration) {
            self.scheduled.retain(|i| *i > iteration);
            return Ok(Vec::new());
        }
        loop {
            if let Some(actions) = self.rx.remove(&iteration) {
                self.rx.retain(|i, _| *i > iteration);
                self.scheduled.retain(|i| *i > iteration);
                return Ok(actions);
            }
            if self.has_departed_before(iteration) {
                self.scheduled.retain(|i| *i > iteration);
                return Ok(Vec::new());
            }
            self.pump(iteration).await?;
        }
    }

    async fn transmit(&mut self, packet: &[u8]) {
        if let Err(e) = self.socket.send(packet).await {
            self.flag_disconnected(&e);
        }
    }

    fn flag_disconnected(&mut self, e: &std::io::Error) {
        if !self.disconnected {
            warn!(host = %self.host, error = %e, "peer socket failed, flagging disconnected");
        }
        self.disconnected = true;
    }

    /// Read one datagram and merge it, waiting at most `recv_timeout`.
    ///
    /// A failed send shows up as an error on the next receive, ahead of
    /// datagrams that are already queued. The error is cleared once
    /// reported, so the wait goes on for the rest of the window. A peer
    /// whose socket keeps failing is reported as disconnected only after
    /// the full window, never sooner.
    async fn pump(&mut self, waiting_for: u64) -> Result<(), SyncError> {
        let deadline = Instant::now() + self.recv_timeout;
        let mut failures = 0;
        let data = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.socket.recv(remaining).await {
                Ok(data) => break data,
                Err(SyncError::Io(e)) => {
                    self.flag_disconnected(&e);
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tokio::time::sleep_until(deadline).await;
                        return Err(SyncError::PeerDisconnected(self.host.id));
                    }
                }
                Err(SyncError::Timeout(_)) if self.disconnected => {
                    return Err(SyncError::PeerDisconnected(self.host.id));
                }
                Err(SyncError::Timeout(_)) => return Err(SyncError::Timeout(self.recv_timeout)),
                Err(e) => return Err(e),
            }
        };
        match Frame::decode(&data)? {
            Frame::Actions { executed, backlog } => {
                if self.disconnected {
                    info!(host = %self.host, "peer reachable again");
                    self.disconnected = false;
                    self.disconnect_reported = false;
                }
                self.merge(executed, backlog, waiting_for)
            }
            Frame::Goodbye {
                executed,
                last_scheduled,
                backlog,
            } => {
                if self.departs_after.is_none() {
                    info!(host = %self.host, last_scheduled, "peer is leaving");
                }
                self.departs_after = Some(last_scheduled);
                self.merge(executed, backlog, waiting_for)
            }
            other => Err(SyncError::ProtocolViolation(format!(
                "{} sent {other} on a peer socket",
                self.host
            ))),
        }
    }

    fn merge(&mut self, executed: u64, backlog: Backlog, waiting_for: u64) -> Result<(), SyncError> {
        // The peer has executed everything below `executed`.
        self.tx.retain(|i, _| *i >= executed);
        for (iteration, actions) in backlog {
            if iteration < waiting_for {
                continue;
            }
            match self.rx.get(&iteration) {
                Some(known) if *known != actions => {
                    return Err(SyncError::ProtocolViolation(format!(
                        "{} changed its actions for iteration {iteration}",
                        self.host
                    )));
                }
                Some(_) => {}
                None => {
                    debug!(host = %self.host, iteration, count = actions.len(), "received actions");
                    self.rx.insert(iteration, actions);
                }
            }
        }
        Ok(())
    }
}

// ── Peer ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Peer {
    Local(LocalHost),
    Remote(RemoteHost),
}

impl Peer {
    pub fn host(&self) -> &Host {
        match self {
            Peer::Local(h) => h.host(),
            Peer::Remote(h) => h.host(),
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteHost> {
        match self {
            Peer::Remote(h) => Some(h),
            Peer::Local(_) => None,
        }
    }

    pub fn as_remote_mut(&mut self) -> Option<&mut RemoteHost> {
        match self {
            Peer::Remote(h) => Some(h),
            Peer::Local(_) => None,
        }
    }

    pub async fn send_actions(
        &mut self,
        scheduled: u64,
        executed: u64,
        actions: Vec<Action>,
    ) -> Result<(), SyncError> {
        match self {
            Peer::Local(h) => {
                h.send_actions(scheduled, actions);
                Ok(())
            }
            Peer::Remote(h) => h.send_actions(scheduled, executed, actions).await,
        }
    }

    pub async fn recv_actions(&mut self, iteration: u64) -> Result<Vec<Action>, SyncError> {
        match self {
            Peer::Local(h) => Ok(h.recv_actions(iteration)),
            Peer::Remote(h) => h.recv_actions(iteration).await,
        }
    }

    pub async fn resend_actions(&mut self) {
        if let Peer::Remote(h) = self {
            h.resend_actions().await;
        }
    }
}
