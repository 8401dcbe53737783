//! The application-facing handle: one engine plus its connection role.
//!
//! | Role        | Latency | Seed              | `update()`                        |
//! |-------------|---------|-------------------|-----------------------------------|
//! | hosting     | 0       | local, at start   | one iteration                     |
//! | listening   | config  | on each admission | iteration + rendezvous handling   |
//! | connecting  | config  | from the network  | admission polling, then iteration |
//!
//! ```no_run
//! # async fn run() -> Result<(), lockstep_core::SyncError> {
//! use lockstep_core::{Session, SyncConfig, Value};
//!
//! let mut session = Session::listener(SyncConfig::default(), "alice", 7777, Value::Null, ());
//! session.start_connecting().await?;
//! loop {
//!     session.engine_mut().run_action_on_all("tick", vec![Value::from(1)])?;
//!     session.update().await?;
//!     for (host, actions) in session.iteration_actions() {
//!         println!("{host}: {actions:?}");
//!     }
//! }
//! # }
//! ```

use std::net::SocketAddr;

use crate::codec::Value;
use crate::config::SyncConfig;
use crate::engine::{IterationActions, SyncEngine};
use crate::error::SyncError;
use crate::events::SessionEvents;
use crate::state::{ConnectionPhase, Connector, Listener};

#[derive(Debug)]
enum Role {
    Hosting {
        phase: ConnectionPhase,
        publicized_data: Value,
    },
    Listening(Listener),
    Connecting(Connector),
}

pub struct Session<E> {
    engine: SyncEngine<E>,
    role: Role,
}

impl<E: SessionEvents> Session<E> {
    /// A session with no peers and no way to get any.
    pub fn hoster(
        config: SyncConfig,
        local_name: impl Into<String>,
        publicized_data: Value,
        events: E,
    ) -> Self {
        let mut engine = SyncEngine::new(config, local_name, events);
        engine.set_latency(0);
        engine.seed_locally();
        Self {
            engine,
            role: Role::Hosting {
                phase: ConnectionPhase::syncing(),
                publicized_data,
            },
        }
    }

    /// A session that admits peers on `port` once started. Port 0 binds
    /// an ephemeral port; see [`Session::rendezvous_addr`].
    pub fn listener(
        config: SyncConfig,
        local_name: impl Into<String>,
        port: u16,
        publicized_data: Value,
        events: E,
    ) -> Self {
        Self {
            engine: SyncEngine::new(config, local_name, events),
            role: Role::Listening(Listener::new(port, publicized_data)),
        }
    }

    /// A session that joins the listener at `address` once started.
    pub fn connector(
        config: SyncConfig,
        local_name: impl Into<String>,
        address: SocketAddr,
        events: E,
    ) -> Self {
        Self {
            engine: SyncEngine::new(config, local_name, events),
            role: Role::Connecting(Connector::new(address)),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Listening: bind the rendezvous port. Connecting: run the welcome
    /// exchange, failing with `ConnectionFailed` when declined or
    /// unanswered. Hosting: nothing to do.
    pub async fn start_connecting(&mut self) -> Result<(), SyncError> {
        match &mut self.role {
            Role::Hosting { .. } => Ok(()),
            Role::Listening(listener) => listener.start(&mut self.engine).await,
            Role::Connecting(connector) => connector.start(&mut self.engine).await,
        }
    }

    /// Stop admitting new peers.
    ///
    /// Only this host stops executing `ConnectTo`. Hosts that keep
    /// accepting would seat a newcomer this host ignores, so issue the call
    /// from a synchronized action that every host executes at the same
    /// iteration.
    pub async fn stop_connecting(&mut self) -> Result<(), SyncError> {
        match &mut self.role {
            Role::Hosting { .. } => Ok(()),
            Role::Listening(listener) => listener.stop(&mut self.engine).await,
            Role::Connecting(connector) => connector.stop(&mut self.engine),
        }
    }

    /// Advance the session by one tick. May block until every peer's
    /// contribution for the current iteration has arrived.
    pub async fn update(&mut self) -> Result<(), SyncError> {
        match &mut self.role {
            Role::Hosting { .. } => self.engine.sync_actions().await,
            Role::Listening(listener) => {
                let outcome = listener.update(&mut self.engine).await;
                let admissions = self.engine.take_admissions();
                listener.complete_admissions(&mut self.engine, admissions);
                outcome
            }
            Role::Connecting(connector) => {
                let outcome = connector.update(&mut self.engine).await;
                self.engine.take_admissions();
                outcome
            }
        }
    }

    /// Announce departure to every peer and hand back the event sink.
    pub async fn leave(mut self) -> Result<E, SyncError> {
        if let Role::Listening(listener) = &mut self.role {
            if !listener.phase().is_syncing() {
                listener.stop(&mut self.engine).await?;
            }
        }
        self.engine.say_goodbye().await?;
        Ok(self.engine.into_events())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn engine(&self) -> &SyncEngine<E> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine<E> {
        &mut self.engine
    }

    pub fn iteration_actions(&mut self) -> IterationActions {
        self.engine.iteration_actions()
    }

    /// Session metadata: our own for hosting and listening sessions, the
    /// listener's once a connecting session has been welcomed.
    pub fn publicized_data(&self) -> Result<&Value, SyncError> {
        match &self.role {
            Role::Hosting {
                publicized_data, ..
            } => Ok(publicized_data),
            Role::Listening(listener) => Ok(listener.publicized_data()),
            Role::Connecting(connector) => connector.publicized_data(),
        }
    }

    pub fn phase(&self) -> &ConnectionPhase {
        match &self.role {
            Role::Hosting { phase, .. } => phase,
            Role::Listening(listener) => listener.phase(),
            Role::Connecting(connector) => connector.phase(),
        }
    }

    /// Bound address of the rendezvous socket while listening.
    pub fn rendezvous_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Listening(listener) => listener.rendezvous_addr(),
            _ => None,
        }
    }

    pub fn is_negotiating(&self) -> bool {
        self.phase().is_negotiating()
    }

    /// Whether `update` runs plain iterations.
    pub fn is_in_network(&self) -> bool {
        self.phase().is_syncing()
    }

    /// Whether `update` advances the iteration count. True for every
    /// hosting or listening phase, and for a connector once it joined.
    pub fn is_ticking(&self) -> bool {
        !matches!(
            self.phase(),
            ConnectionPhase::Idle | ConnectionPhase::Connecting
        )
    }
}
