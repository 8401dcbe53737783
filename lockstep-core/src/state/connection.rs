//! Connection lifecycle shared by the listening and connecting roles.
//!
//! Provides a `ConnectionPhase` enum with validated transitions that
//! return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::SyncError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// Where a session is in its handshake.
///
/// ```text
///  listening side:  Idle ──► Listening ◄──► Negotiating
///                     │          │               │
///                     └──────────┴───────────────┴──► Syncing
///
///  joining side:    Idle ──► Connecting ──► Syncing
/// ```
///
/// A hosting session starts directly in `Syncing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Nothing started yet. Also where a failed join returns to.
    #[default]
    Idle,

    /// Ticking and polling the rendezvous socket for requests.
    Listening,

    /// Ticking and exchanging welcome / port list with one requester.
    Negotiating,

    /// Welcomed; waiting for every existing host to connect back.
    Connecting,

    /// Plain lockstep iterations.
    Syncing {
        /// When the session entered the `Syncing` state.
        since: Instant,
    },
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Listening => write!(f, "Listening"),
            Self::Negotiating => write!(f, "Negotiating"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Syncing { .. } => write!(f, "Syncing"),
        }
    }
}

impl ConnectionPhase {
    pub fn syncing() -> Self {
        Self::Syncing {
            since: Instant::now(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// How long the session has been in the `Syncing` state.
    ///
    /// Returns `None` for any other phase.
    pub fn syncing_duration(&self) -> Option<Duration> {
        match self {
            Self::Syncing { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn start_listening(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Idle => {
                *self = Self::Listening;
                Ok(())
            }
            _ => Err(SyncError::InvalidState("cannot listen: not in Idle state")),
        }
    }

    /// Valid from: `Listening`.
    pub fn begin_negotiation(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Listening => {
                *self = Self::Negotiating;
                Ok(())
            }
            _ => Err(SyncError::InvalidState(
                "cannot negotiate: not in Listening state",
            )),
        }
    }

    /// Valid from: `Negotiating`.
    pub fn end_negotiation(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Negotiating => {
                *self = Self::Listening;
                Ok(())
            }
            _ => Err(SyncError::InvalidState(
                "cannot end negotiation: not in Negotiating state",
            )),
        }
    }

    /// Valid from: `Idle`, `Listening`, `Negotiating`.
    pub fn stop_listening(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Idle | Self::Listening | Self::Negotiating => {
                *self = Self::syncing();
                Ok(())
            }
            _ => Err(SyncError::InvalidState(
                "cannot stop listening: not listening",
            )),
        }
    }

    /// Valid from: `Idle`.
    pub fn begin_connecting(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(SyncError::InvalidState(
                "cannot connect: not in Idle state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn join(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Connecting => {
                *self = Self::syncing();
                Ok(())
            }
            _ => Err(SyncError::InvalidState(
                "cannot join: not in Connecting state",
            )),
        }
    }

    /// Force-reset to `Idle` regardless of current state.
    pub fn abort(&mut self) {
        *self = Self::Idle;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_lifecycle() {
        let mut phase = ConnectionPhase::default();
        assert!(phase.is_idle());

        phase.start_listening().unwrap();
        assert_eq!(phase, ConnectionPhase::Listening);

        phase.begin_negotiation().unwrap();
        assert!(phase.is_negotiating());

        phase.end_negotiation().unwrap();
        assert_eq!(phase, ConnectionPhase::Listening);

        phase.stop_listening().unwrap();
        assert!(phase.is_syncing());
        assert!(phase.syncing_duration().is_some());
    }

    #[test]
    fn joining_lifecycle() {
        let mut phase = ConnectionPhase::Idle;
        phase.begin_connecting().unwrap();
        assert_eq!(phase, ConnectionPhase::Connecting);
        phase.join().unwrap();
        assert!(phase.is_syncing());
    }

    #[test]
    fn stop_while_negotiating() {
        let mut phase = ConnectionPhase::Negotiating;
        phase.stop_listening().unwrap();
        assert!(phase.is_syncing());
    }

    #[test]
    fn invalid_transitions() {
        assert!(ConnectionPhase::Idle.begin_negotiation().is_err());
        assert!(ConnectionPhase::Listening.join().is_err());
        assert!(ConnectionPhase::Connecting.start_listening().is_err());
        assert!(ConnectionPhase::syncing().begin_connecting().is_err());
        assert!(ConnectionPhase::syncing().stop_listening().is_err());
        assert!(ConnectionPhase::Listening.end_negotiation().is_err());
    }

    #[test]
    fn abort_from_any_state() {
        let mut phase = ConnectionPhase::Connecting;
        phase.abort();
        assert!(phase.is_idle());
        let mut phase = ConnectionPhase::syncing();
        phase.abort();
        assert!(phase.is_idle());
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionPhase::Idle.to_string(), "Idle");
        assert_eq!(ConnectionPhase::Negotiating.to_string(), "Negotiating");
        assert_eq!(ConnectionPhase::syncing().to_string(), "Syncing");
        assert_eq!(ConnectionPhase::syncing_duration(&ConnectionPhase::Idle), None);
    }
}
