//! Demo node core logic.
//!
//! Builds the configured session, paces it with a fixed-rate interval
//! and logs every resolved iteration. Stopping (Ctrl-C or the tick
//! limit) stops admissions and leaves with a goodbye.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lockstep_core::{Host, Session, SessionEvents, SyncError, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{Mode, NodeConfig};

// ── NodeEvents ───────────────────────────────────────────────────

/// Session collaborator that logs every notification.
#[derive(Debug, Default)]
pub struct NodeEvents {
    /// Iterations completed.
    pub iterations: u64,
    /// Hosts that joined after the session started.
    pub joined: u64,
    /// Hosts that left or were evicted.
    pub departed: u64,
}

impl SessionEvents for NodeEvents {
    fn host_connected(&mut self, host: &Host, address: SocketAddr) {
        self.joined += 1;
        info!(%host, %address, "peer connected");
    }

    fn host_removed(&mut self, host: &Host) {
        self.departed += 1;
        info!(%host, "peer removed");
    }

    fn host_disconnected(&mut self, host: &Host) {
        warn!(%host, "peer socket failed");
    }

    fn timeout_group_add(&mut self, host: &Host) {
        warn!(%host, "waiting on peer");
    }

    fn timeout_group_remove(&mut self, host: &Host) {
        info!(%host, "peer caught up");
    }

    fn iteration_done(&mut self, _iteration: u64) {
        self.iterations += 1;
    }

    fn new_connector(&mut self, name: &str, address: SocketAddr) {
        info!(name, %address, "connection request");
    }

    fn connector_ready(&mut self, name: &str, address: SocketAddr) {
        info!(name, %address, "connector sent its ports");
    }

    fn got_first_connection(&mut self) {
        info!("first host connected back");
    }

    fn in_network(&mut self) {
        info!("in the network");
    }

    fn hosting_new_host(&mut self, host: &Host) {
        info!(%host, "now hosting");
    }

    fn protocol_violation(&mut self, error: &SyncError) {
        warn!(%error, "protocol violation");
    }
}

// ── NodeService ──────────────────────────────────────────────────

/// Runs one session until stopped or the tick limit is reached.
pub struct NodeService {
    config: NodeConfig,
    running: Arc<AtomicBool>,
}

impl NodeService {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the service from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Create the session for the configured mode.
    pub fn build_session(&self) -> Result<Session<NodeEvents>, Box<dyn std::error::Error>> {
        let session = &self.config.session;
        let sync = self.config.sync.clone();
        let data = Value::str(format!("{}'s session", session.name));
        Ok(match session.mode {
            Mode::Local => Session::hoster(sync, &session.name, data, NodeEvents::default()),
            Mode::Listen => Session::listener(
                sync,
                &session.name,
                session.port,
                data,
                NodeEvents::default(),
            ),
            Mode::Connect => {
                let address: SocketAddr = session.address.parse()?;
                Session::connector(sync, &session.name, address, NodeEvents::default())
            }
        })
    }

    /// Run the session until stopped.
    ///
    /// 1. Starts connecting (binds the rendezvous port, or joins).
    /// 2. Each tick enqueues `tick(counter)` on every host whenever the
    ///    session is iterating, runs one update and logs the resolved
    ///    actions. A connector only starts counting once it joined.
    /// 3. On stop, stops admitting peers and leaves with a goodbye.
    pub async fn run(&self) -> Result<NodeEvents, Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);
        let mut session = self.build_session()?;
        session.start_connecting().await?;
        if let Ok(data) = session.publicized_data() {
            info!(?data, "session started");
        }

        let mut interval = tokio::time::interval(self.config.session.tick_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let limit = self.config.session.ticks;
        let mut counter: u64 = 0;

        while self.running.load(Ordering::SeqCst) && limit.is_none_or(|limit| counter < limit) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = Self::wait_for_stop(&self.running) => break,
            }

            if session.is_ticking() {
                session
                    .engine_mut()
                    .run_action_on_all("tick", vec![Value::from(counter)])?;
                counter += 1;
            }
            match session.update().await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => warn!(error = %e, "tick failed, retrying"),
                Err(e) => return Err(e.into()),
            }

            let iteration = session.engine().iteration_count();
            for (host, actions) in session.iteration_actions() {
                for action in actions {
                    debug!(iteration, %host, ?action, "resolved");
                }
            }
            if counter > 0 && counter % u64::from(self.config.session.iterations_per_second.max(1)) == 0 {
                info!(
                    iteration,
                    hosts = session.engine().host_ids().len(),
                    latency = session.engine().latency(),
                    "running"
                );
            }
        }

        if session.is_in_network() || session.is_negotiating() {
            session.stop_connecting().await?;
        }
        let events = session.leave().await?;
        self.running.store(false, Ordering::SeqCst);
        info!(
            iterations = events.iterations,
            joined = events.joined,
            departed = events.departed,
            "node stopped"
        );
        Ok(events)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
