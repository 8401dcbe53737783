//! # lockstep-core
//!
//! Peer-to-peer lockstep synchronization over UDP: every participant
//! executes the same sequence of logical iterations, each fed by the
//! union of all participants' actions for that iteration.
//!
//! This crate contains:
//! - **Codec**: `Value` and the tagged, zstd-compressed wire encoding
//! - **Frames**: `Frame` and `Identification` datagrams, `Action` payloads
//! - **Transport**: UDP sockets, connected peer sockets, multiplexed waits
//! - **Hosts**: `Host`, `LocalHost`, `RemoteHost` action queues
//! - **Engine**: `SyncEngine`, the per-iteration send/collect/execute step
//! - **State**: `ConnectionPhase` and the listening/connecting handshakes
//! - **Session**: `Session`, the role-aware entry point
//! - **Error**: `SyncError`, a typed, `thiserror`-based error hierarchy

pub mod action;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod host;
pub mod session;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use action::{Action, INTERNAL_PREFIX, InternalAction, UserAction};
pub use codec::Value;
pub use config::{MAX_PACKET_SIZE, PROTOCOL_VERSION, SyncConfig};
pub use engine::{IterationActions, SyncEngine};
pub use error::SyncError;
pub use events::SessionEvents;
pub use frame::{Backlog, Frame, Identification};
pub use host::{Host, HostId, LocalHost, Peer, RemoteHost};
pub use session::Session;
pub use state::ConnectionPhase;
pub use transport::PeerSocket;
