//! Handshake roles layered on the engine.

mod connection;
mod connector;
mod listener;

pub use connection::ConnectionPhase;
pub(crate) use connector::Connector;
pub(crate) use listener::Listener;
