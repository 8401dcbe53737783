//! The per-iteration synchronization core shared by every role.
//!
//! One call to [`SyncEngine::sync_actions`] executes one logical
//! iteration:
//!
//! ```text
//!  send     every host ◄── outgoing[host] tagged iteration + latency
//!  collect  every host ──► actions for iteration   (retry silent ones)
//!  execute  internal actions now, user actions via iteration_actions()
//!  advance  iteration += 1
//! ```
//!
//! An iteration completes only once every known host's contribution is
//! in. Hosts are visited in id order, which every peer agrees on.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::action::{Action, InternalAction, UserAction};
use crate::codec::Value;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::SessionEvents;
use crate::host::{Host, HostId, LocalHost, Peer, RemoteHost};
use crate::transport::{self, PeerSocket};

/// A peer admitted by an executed `ConnectTo`.
#[derive(Debug, Clone)]
pub(crate) struct Admission {
    pub host: Host,
    pub original_address: SocketAddr,
}

/// Resolved user actions for one iteration, per source host in id order.
pub type IterationActions = Vec<(Host, Vec<UserAction>)>;

pub struct SyncEngine<E> {
    config: SyncConfig,
    events: E,
    local: Host,
    peers: BTreeMap<HostId, Peer>,
    outgoing: BTreeMap<HostId, Vec<Action>>,
    resolved: IterationActions,
    iteration_count: u64,
    latency: u64,
    /// Silent hosts and when they went silent.
    timeout_group: BTreeMap<HostId, Instant>,
    seed: Option<u64>,
    accepting_peers: bool,
    admissions: Vec<Admission>,
}

impl<E: SessionEvents> SyncEngine<E> {
    /// New engine whose only host is the local one, under a random id.
    pub fn new(config: SyncConfig, local_name: impl Into<String>, events: E) -> Self {
        Self::with_host_id(config, rand::random(), local_name, events)
    }

    /// Like [`SyncEngine::new`] with a caller-chosen local id.
    pub fn with_host_id(
        config: SyncConfig,
        local_id: HostId,
        local_name: impl Into<String>,
        events: E,
    ) -> Self {
        let latency = config.latency;
        let mut engine = Self {
            config,
            events,
            local: Host::new(local_id, local_name),
            peers: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            resolved: Vec::new(),
            iteration_count: 0,
            latency,
            timeout_group: BTreeMap::new(),
            seed: None,
            accepting_peers: false,
            admissions: Vec::new(),
        };
        let local = engine.local.clone();
        info!(host = %local, "local host created");
        engine.events.host_added(&local);
        engine.peers.insert(local_id, Peer::Local(LocalHost::new(local)));
        engine
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn into_events(self) -> E {
        self.events
    }

    pub fn local_host(&self) -> &Host {
        &self.local
    }

    /// Every host in the session, sorted by id.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.peers.values().map(Peer::host)
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.peers.keys().copied().collect()
    }

    pub fn host(&self, id: HostId) -> Option<&Host> {
        self.peers.get(&id).map(Peer::host)
    }

    pub fn remote_hosts(&self) -> impl Iterator<Item = &RemoteHost> {
        self.peers.values().filter_map(Peer::as_remote)
    }

    /// Hosts that are currently not answering.
    pub fn timeout_group(&self) -> impl Iterator<Item = &Host> {
        self.timeout_group.keys().filter_map(move |id| self.host(*id))
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Change the scheduling delay. A decrease never overwrites slots
    /// that were already promised.
    pub fn set_latency(&mut self, latency: u64) {
        if latency != self.latency {
            info!(from = self.latency, to = latency, "latency changed");
        }
        self.latency = latency;
    }

    /// The iteration that actions enqueued now will execute at.
    pub fn scheduled_iteration(&self) -> u64 {
        self.iteration_count + self.latency
    }

    pub fn is_accepting_peers(&self) -> bool {
        self.accepting_peers
    }

    pub(crate) fn set_accepting_peers(&mut self, accepting: bool) {
        self.accepting_peers = accepting;
    }

    pub(crate) fn set_iteration_count(&mut self, iteration: u64) {
        self.iteration_count = iteration;
    }

    pub(crate) fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Pick a seed without consulting anyone; only valid while alone.
    pub(crate) fn seed_locally(&mut self) {
        self.seed = Some(u64::from(rand::random::<u32>()));
    }

    pub(crate) fn take_admissions(&mut self) -> Vec<Admission> {
        std::mem::take(&mut self.admissions)
    }

    // ── Enqueueing ───────────────────────────────────────────────

    /// Have `host` execute `name(args)` at the scheduled iteration.
    pub fn run_action_on(
        &mut self,
        host: HostId,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), SyncError> {
        let action = Action::User(UserAction::new(name, args)?);
        self.enqueue(host, action)
    }

    pub fn run_action_on_all(&mut self, name: &str, args: Vec<Value>) -> Result<(), SyncError> {
        let action = Action::User(UserAction::new(name, args)?);
        self.enqueue_many(self.host_ids(), action);
        Ok(())
    }

    pub fn run_action_locally(&mut self, name: &str, args: Vec<Value>) -> Result<(), SyncError> {
        self.run_action_on(self.local.id, name, args)
    }

    pub fn run_action_remotely(&mut self, name: &str, args: Vec<Value>) -> Result<(), SyncError> {
        let action = Action::User(UserAction::new(name, args)?);
        let remotes = self
            .host_ids()
            .into_iter()
            .filter(|id| *id != self.local.id)
            .collect();
        self.enqueue_many(remotes, action);
        Ok(())
    }

    pub(crate) fn run_internal_on(
        &mut self,
        host: HostId,
        action: InternalAction,
    ) -> Result<(), SyncError> {
        self.enqueue(host, Action::Internal(action))
    }

    pub(crate) fn run_internal_on_all(&mut self, action: InternalAction) {
        self.enqueue_many(self.host_ids(), Action::Internal(action));
    }

    fn enqueue(&mut self, host: HostId, action: Action) -> Result<(), SyncError> {
        if !self.peers.contains_key(&host) {
            return Err(SyncError::UnknownHost(host));
        }
        self.outgoing.entry(host).or_default().push(action);
        Ok(())
    }

    fn enqueue_many(&mut self, hosts: Vec<HostId>, action: Action) {
        for host in hosts {
            self.outgoing.entry(host).or_default().push(action.clone());
        }
    }

    // ── Results ──────────────────────────────────────────────────

    /// Drain the user actions of the iteration that just completed.
    pub fn iteration_actions(&mut self) -> IterationActions {
        std::mem::take(&mut self.resolved)
    }

    /// A generator seeded from the shared seed. Each call advances the
    /// seed, so peers stay in step only if they draw in the same order.
    pub fn random(&mut self) -> Result<ChaCha8Rng, SyncError> {
        let seed = self.seed.ok_or(SyncError::NotSeeded)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.seed = Some(u64::from(rng.next_u32()));
        Ok(rng)
    }

    // ── Host bookkeeping ─────────────────────────────────────────

    /// Add a connected peer. Ids must be unique across the session.
    pub(crate) fn add_remote(&mut self, remote: RemoteHost) -> Result<(), SyncError> {
        let host = remote.host().clone();
        let address = remote.address();
        let id = host.id;
        if self.peers.contains_key(&id) {
            return Err(SyncError::DuplicateHostId(id));
        }
        info!(%host, %address, "host added");
        self.peers.insert(id, Peer::Remote(remote));
        self.events.host_added(&host);
        self.events.host_connected(&host, address);
        Ok(())
    }

    fn remove_host(&mut self, id: HostId) {
        if id == self.local.id {
            return;
        }
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        let host = peer.host().clone();
        self.outgoing.remove(&id);
        if self.timeout_group.remove(&id).is_some() {
            self.events.timeout_group_remove(&host);
        }
        info!(%host, "host removed");
        self.events.host_removed(&host);
    }

    fn enter_timeout_group(&mut self, id: HostId) {
        if let Entry::Vacant(slot) = self.timeout_group.entry(id) {
            slot.insert(Instant::now());
            if let Some(host) = self.peers.get(&id).map(|p| p.host().clone()) {
                warn!(%host, "host stopped responding");
                self.events.timeout_group_add(&host);
            }
        }
    }

    fn leave_timeout_group(&mut self, id: HostId) {
        if self.timeout_group.remove(&id).is_some() {
            if let Some(host) = self.peers.get(&id).map(|p| p.host().clone()) {
                info!(%host, "host responding again");
                self.events.timeout_group_remove(&host);
            }
        }
    }

    fn report_disconnect(&mut self, id: HostId) {
        let Some(remote) = self.peers.get_mut(&id).and_then(Peer::as_remote_mut) else {
            return;
        };
        if remote.take_disconnect_notice() {
            let host = remote.host().clone();
            self.events.host_disconnected(&host);
        }
    }

    /// Drop silent hosts that have exceeded the eviction timeout.
    fn evict_unresponsive(&mut self, silent: &mut Vec<HostId>) {
        let Some(limit) = self.config.eviction_timeout() else {
            return;
        };
        let expired: Vec<HostId> = silent
            .iter()
            .copied()
            .filter(|id| {
                self.timeout_group
                    .get(id)
                    .is_some_and(|since| since.elapsed() >= limit)
            })
            .collect();
        for id in expired {
            warn!(host = id, ?limit, "evicting unresponsive host");
            self.remove_host(id);
            silent.retain(|s| *s != id);
        }
    }

    /// Remove hosts whose goodbye said they take no part in `iteration`.
    fn drop_departed(&mut self, iteration: u64) {
        let departed: Vec<HostId> = self
            .remote_hosts()
            .filter(|r| r.has_departed_before(iteration))
            .map(|r| r.host().id)
            .collect();
        for id in departed {
            self.remove_host(id);
        }
    }

    // ── Iteration ────────────────────────────────────────────────

    /// Run one logical iteration.
    pub(crate) async fn sync_actions(&mut self) -> Result<(), SyncError> {
        let iteration = self.iteration_count;
        let scheduled = self.scheduled_iteration();

        let mut outgoing = std::mem::take(&mut self.outgoing);
        for (id, peer) in self.peers.iter_mut() {
            let actions = outgoing.remove(id).unwrap_or_default();
            peer.send_actions(scheduled, iteration, actions).await?;
        }

        let received = self.gather(iteration).await?;
        self.drop_departed(iteration);

        let mut resolved = Vec::with_capacity(received.len());
        for (id, actions) in received {
            let Some(host) = self.host(id).cloned() else {
                continue;
            };
            let mut user = Vec::new();
            for action in actions {
                match action {
                    Action::Internal(internal) => self.execute_internal(internal).await?,
                    Action::User(action) => user.push(action),
                }
            }
            resolved.push((host, user));
        }

        if !self.resolved.is_empty() {
            debug!(iteration, "previous iteration actions were never consumed");
        }
        self.resolved = resolved;
        self.events.iteration_done(iteration);
        self.iteration_count += 1;
        Ok(())
    }

    /// Gather every host's contribution for `iteration`, resending to and
    /// re-waiting on silent hosts until they answer or are evicted.
    async fn gather(
        &mut self,
        iteration: u64,
    ) -> Result<BTreeMap<HostId, Vec<Action>>, SyncError> {
        let mut received = BTreeMap::new();
        let mut waiting = self.host_ids();
        loop {
            let mut silent = Vec::new();
            for id in waiting {
                let Some(peer) = self.peers.get_mut(&id) else {
                    continue;
                };
                let outcome = peer.recv_actions(iteration).await;
                self.report_disconnect(id);
                match outcome {
                    Ok(actions) => {
                        self.leave_timeout_group(id);
                        received.insert(id, actions);
                    }
                    Err(e) if e.is_recoverable() => {
                        debug!(host = id, iteration, error = %e, "no contribution yet");
                        self.enter_timeout_group(id);
                        silent.push(id);
                    }
                    Err(e) => return Err(e),
                }
            }

            self.evict_unresponsive(&mut silent);
            if silent.is_empty() {
                return Ok(received);
            }

            let mut waiting_on = Vec::with_capacity(silent.len());
            for id in &silent {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.resend_actions().await;
                    waiting_on.push(peer.host().clone());
                }
            }
            self.events.timeout(&waiting_on);
            waiting = silent;
        }
    }

    async fn execute_internal(&mut self, action: InternalAction) -> Result<(), SyncError> {
        match action {
            InternalAction::ResetRandomSeed => {
                let seed = self
                    .peers
                    .keys()
                    .fold(self.iteration_count, |acc, id| acc.wrapping_add(u64::from(*id)));
                debug!(iteration = self.iteration_count, seed, "random seed reset");
                self.seed = Some(seed);
                Ok(())
            }
            InternalAction::ConnectTo {
                remote_id,
                remote_name,
                original_address,
                address,
            } => {
                if !self.accepting_peers {
                    debug!(remote_id, "not accepting peers, ignoring admission");
                    return Ok(());
                }
                let host = Host::new(remote_id, remote_name);
                let socket = transport::udp_socket_for(&address).await?;
                let socket = PeerSocket::connect(socket, address, self.config.max_packet_size).await?;
                self.add_remote(RemoteHost::new(
                    host.clone(),
                    socket,
                    self.config.recv_timeout(),
                ))?;
                self.admissions.push(Admission {
                    host,
                    original_address,
                });
                Ok(())
            }
        }
    }

    /// Tell every peer this host leaves after the iterations it already
    /// scheduled.
    pub(crate) async fn say_goodbye(&mut self) -> Result<(), SyncError> {
        let executed = self.iteration_count;
        let last_scheduled = self.scheduled_iteration().saturating_sub(1);
        let repeats = self.config.goodbye_repeats;
        for peer in self.peers.values_mut() {
            if let Some(remote) = peer.as_remote_mut() {
                remote.send_goodbye(executed, last_scheduled, repeats).await?;
            }
        }
        info!(last_scheduled, "left the session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::config::MAX_PACKET_SIZE;
    use crate::frame::{Backlog, Frame};

    #[derive(Debug, Default)]
    struct Recorder {
        added: Vec<HostId>,
        removed: Vec<HostId>,
        connected: Vec<HostId>,
        group_add: usize,
        group_remove: usize,
        timeouts: usize,
        done: Vec<u64>,
    }

    impl SessionEvents for Recorder {
        fn host_added(&mut self, host: &Host) {
            self.added.push(host.id);
        }
        fn host_removed(&mut self, host: &Host) {
            self.removed.push(host.id);
        }
        fn host_connected(&mut self, host: &Host, _address: SocketAddr) {
            self.connected.push(host.id);
        }
        fn timeout_group_add(&mut self, _host: &Host) {
            self.group_add += 1;
        }
        fn timeout_group_remove(&mut self, _host: &Host) {
            self.group_remove += 1;
        }
        fn timeout(&mut self, _waiting_on: &[Host]) {
            self.timeouts += 1;
        }
        fn iteration_done(&mut self, iteration: u64) {
            self.done.push(iteration);
        }
    }

    fn solo(latency: u64) -> SyncEngine<Recorder> {
        let config = SyncConfig {
            latency,
            recv_timeout_ms: 30,
            ..Default::default()
        };
        SyncEngine::with_host_id(config, 7, "solo", Recorder::default())
    }

    fn names(actions: &IterationActions) -> Vec<String> {
        actions
            .iter()
            .flat_map(|(_, acts)| acts.iter().map(|a| a.name.clone()))
            .collect()
    }

    async fn attach_fake(engine: &mut SyncEngine<Recorder>, id: HostId) -> UdpSocket {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = PeerSocket::connect(local, fake.local_addr().unwrap(), MAX_PACKET_SIZE)
            .await
            .unwrap();
        let timeout = engine.config().recv_timeout();
        engine
            .add_remote(RemoteHost::new(Host::new(id, "fake"), socket, timeout))
            .unwrap();
        fake
    }

    #[tokio::test]
    async fn action_lands_exactly_latency_iterations_later() {
        let mut engine = solo(2);
        engine.run_action_locally("jump", vec![Value::from(1)]).unwrap();

        for expected in [vec![], vec![], vec!["jump".to_string()]] {
            engine.sync_actions().await.unwrap();
            assert_eq!(names(&engine.iteration_actions()), expected);
        }
        assert_eq!(engine.events().done, vec![0, 1, 2]);
        assert_eq!(engine.iteration_count(), 3);
    }

    #[tokio::test]
    async fn latency_decrease_keeps_first_write() {
        let mut engine = solo(3);
        engine.run_action_locally("early", vec![]).unwrap();
        engine.sync_actions().await.unwrap(); // scheduled for 3

        engine.set_latency(2);
        engine.run_action_locally("late", vec![]).unwrap();
        engine.sync_actions().await.unwrap(); // also targets 3, ignored

        engine.sync_actions().await.unwrap();
        assert!(names(&engine.iteration_actions()).is_empty());
        engine.sync_actions().await.unwrap();
        assert_eq!(names(&engine.iteration_actions()), vec!["early"]);
    }

    #[tokio::test]
    async fn results_come_back_per_host() {
        let mut engine = solo(0);
        engine.run_action_on_all("a", vec![]).unwrap();
        engine.run_action_remotely("nobody", vec![]).unwrap();
        engine.sync_actions().await.unwrap();
        let actions = engine.iteration_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].0.id, 7);
        assert_eq!(names(&actions), vec!["a"]);
        // Drained.
        assert!(engine.iteration_actions().is_empty());
    }

    #[test]
    fn bad_targets_are_rejected() {
        let mut engine = solo(1);
        assert!(matches!(
            engine.run_action_on(99, "x", vec![]),
            Err(SyncError::UnknownHost(99))
        ));
        assert!(matches!(
            engine.run_action_on_all("INTERNAL_reset_random_seed", vec![]),
            Err(SyncError::ReservedActionName(_))
        ));
    }

    #[tokio::test]
    async fn random_needs_a_seed() {
        let mut engine = solo(1);
        assert!(matches!(engine.random(), Err(SyncError::NotSeeded)));

        engine.run_internal_on_all(InternalAction::ResetRandomSeed);
        engine.sync_actions().await.unwrap();
        assert!(engine.random().is_err());
        engine.sync_actions().await.unwrap();

        // Executed at iteration 1 with the single host id 7.
        assert_eq!(engine.seed(), Some(8));
        // Internal actions never reach the application.
        assert!(names(&engine.iteration_actions()).is_empty());

        // The first draw of the stream becomes the next seed.
        let mut expected = ChaCha8Rng::seed_from_u64(8);
        let next_seed = u64::from(expected.next_u32());
        let mut rng = engine.random().unwrap();
        assert_eq!(rng.next_u32(), expected.next_u32());
        assert_eq!(engine.seed(), Some(next_seed));
    }

    #[tokio::test]
    async fn identical_engines_draw_identically() {
        let mut a = solo(1);
        let mut b = solo(1);
        for engine in [&mut a, &mut b] {
            engine.run_internal_on_all(InternalAction::ResetRandomSeed);
            engine.sync_actions().await.unwrap();
            engine.sync_actions().await.unwrap();
        }
        for _ in 0..4 {
            let x = a.random().unwrap().next_u64();
            let y = b.random().unwrap().next_u64();
            assert_eq!(x, y);
        }
    }

    #[tokio::test]
    async fn timeout_group_fires_once_per_streak() {
        let mut engine = solo(0);
        let fake = attach_fake(&mut engine, 9).await;

        // Stay silent through the first send and two resends.
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let mut from = None;
            for _ in 0..3 {
                let (_, addr) = fake.recv_from(&mut buf).await.unwrap();
                from = Some(addr);
            }
            let mut backlog = Backlog::new();
            backlog.insert(0, vec![]);
            let packet = Frame::Actions {
                executed: 0,
                backlog,
            }
            .encode()
            .unwrap();
            fake.send_to(&packet, from.unwrap()).await.unwrap();
            fake
        });

        tokio::time::timeout(Duration::from_secs(5), engine.sync_actions())
            .await
            .unwrap()
            .unwrap();
        let _fake = responder.await.unwrap();

        let events = engine.events();
        assert_eq!(events.group_add, 1);
        assert_eq!(events.group_remove, 1);
        assert!(events.timeouts >= 2);
        assert_eq!(engine.timeout_group().count(), 0);
        assert_eq!(engine.iteration_count(), 1);
    }

    #[tokio::test]
    async fn silent_host_is_evicted_when_configured() {
        let config = SyncConfig {
            latency: 0,
            recv_timeout_ms: 20,
            eviction_timeout_ms: Some(100),
            ..Default::default()
        };
        let mut engine = SyncEngine::with_host_id(config, 7, "solo", Recorder::default());
        let _fake = attach_fake(&mut engine, 9).await;

        tokio::time::timeout(Duration::from_secs(5), engine.sync_actions())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(engine.events().removed, vec![9]);
        assert_eq!(engine.events().group_add, 1);
        assert_eq!(engine.events().group_remove, 1);
        assert_eq!(engine.host_ids(), vec![7]);
        let actions = engine.iteration_actions();
        assert_eq!(actions.len(), 1);
    }

    #[tokio::test]
    async fn connect_to_respects_admission_gate() {
        let mut engine = solo(0);
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let admit = InternalAction::ConnectTo {
            remote_id: 3,
            remote_name: "newcomer".into(),
            original_address: "127.0.0.1:1".parse().unwrap(),
            address: target.local_addr().unwrap(),
        };

        engine.run_internal_on(7, admit.clone()).unwrap();
        engine.sync_actions().await.unwrap();
        assert_eq!(engine.host_ids(), vec![7]);
        assert!(engine.take_admissions().is_empty());

        engine.set_accepting_peers(true);
        engine.run_internal_on(7, admit).unwrap();
        engine.sync_actions().await.unwrap();
        assert_eq!(engine.host_ids(), vec![3, 7]);
        assert_eq!(engine.events().connected, vec![3]);
        let admissions = engine.take_admissions();
        assert_eq!(admissions.len(), 1);
        assert_eq!(admissions[0].host.name, "newcomer");
        assert_eq!(
            engine.remote_hosts().next().map(RemoteHost::address),
            Some(target.local_addr().unwrap())
        );
    }

    #[tokio::test]
    async fn duplicate_id_is_fatal() {
        let mut engine = solo(0);
        let _first = attach_fake(&mut engine, 9).await;
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = PeerSocket::connect(local, "127.0.0.1:9".parse().unwrap(), MAX_PACKET_SIZE)
            .await
            .unwrap();
        let err = engine
            .add_remote(RemoteHost::new(
                Host::new(9, "twin"),
                socket,
                Duration::from_millis(10),
            ))
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateHostId(9)));
    }
}
