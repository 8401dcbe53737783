//! Hooks the application implements to observe a session.
//!
//! Every method has an empty default, so implementors only override the
//! events they care about. All hooks run synchronously inside
//! `Session::update`.

use std::net::SocketAddr;

use crate::error::SyncError;
use crate::host::Host;

pub trait SessionEvents {
    /// A host joined the session (including the local one at startup).
    fn host_added(&mut self, _host: &Host) {}

    fn host_removed(&mut self, _host: &Host) {}

    /// A peer socket towards `host` was opened.
    fn host_connected(&mut self, _host: &Host, _address: SocketAddr) {}

    /// The socket towards `host` failed. Fires once per host.
    fn host_disconnected(&mut self, _host: &Host) {}

    /// `host` stopped answering within the receive timeout.
    fn timeout_group_add(&mut self, _host: &Host) {}

    /// `host` answered again after being in the timeout group.
    fn timeout_group_remove(&mut self, _host: &Host) {}

    /// Another receive round expired; `waiting_on` is still silent.
    /// The application may keep servicing input and rendering here.
    fn timeout(&mut self, _waiting_on: &[Host]) {}

    fn iteration_done(&mut self, _iteration: u64) {}

    /// A joining host identified itself on the rendezvous socket.
    fn new_connector(&mut self, _name: &str, _address: SocketAddr) {}

    /// A joining host sent back its per-host ports.
    fn connector_ready(&mut self, _name: &str, _address: SocketAddr) {}

    /// Joining side: the first existing host connected back.
    fn got_first_connection(&mut self) {}

    /// Joining side: every existing host connected back.
    fn in_network(&mut self) {}

    /// Listening side: admission of `host` was executed.
    fn hosting_new_host(&mut self, _host: &Host) {}

    /// A peer broke the protocol during a handshake.
    fn protocol_violation(&mut self, _error: &SyncError) {}
}

/// Ignores every event.
impl SessionEvents for () {}
