//! Domain-specific error types for the lockstep protocol.
//!
//! All fallible operations return `Result<T, SyncError>`.
//! Timeouts and peer disconnections are recoverable and drive the
//! retry loops; everything else is fatal to the operation in progress.

use std::time::Duration;
use thiserror::Error;

use crate::host::HostId;

/// The canonical error type for the lockstep protocol.
#[derive(Debug, Error)]
pub enum SyncError {
    // ── Transport Errors ─────────────────────────────────────────
    /// No datagram arrived within the bounded wait.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A connected peer socket reported an error; the peer is gone.
    #[error("host {0:#010x} disconnected")]
    PeerDisconnected(HostId),

    /// A socket that is not bound to a single peer failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A frame violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A frame or action tag did not map to any known variant.
    #[error("unknown {type_name}: {value:?}")]
    UnknownVariant {
        type_name: &'static str,
        value: String,
    },

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    /// The handshake was declined or ran out of attempts.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // ── Codec Errors ─────────────────────────────────────────────
    /// A value cannot be represented on the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// Received bytes are not a well-formed encoded value.
    #[error("decode error: {0}")]
    Decode(String),

    // ── Engine Errors ────────────────────────────────────────────
    /// Two hosts drew the same random id. Known, unmitigated limitation.
    #[error("duplicate host id {0:#010x}")]
    DuplicateHostId(HostId),

    /// An action targeted a host that is not part of the session.
    #[error("unknown host {0:#010x}")]
    UnknownHost(HostId),

    /// `random()` was called before a shared seed was established.
    #[error("session not initialized for random generation yet")]
    NotSeeded,

    /// The session metadata has not been received yet.
    #[error("no publicized data available")]
    NoPublicizedData,

    /// User actions may not use the internal prefix.
    #[error("action name {0:?} uses the reserved internal prefix")]
    ReservedActionName(String),

    /// The operation is not valid in the current connection phase.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl SyncError {
    /// Returns `true` for conditions the retry loops absorb.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::PeerDisconnected(_))
    }

    /// Returns `true` for errors that mean the peer broke the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::UnknownVariant { .. } | Self::VersionMismatch { .. }
        )
    }
}

impl From<std::string::FromUtf8Error> for SyncError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        SyncError::Decode(format!("invalid utf-8: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = SyncError::VersionMismatch {
            local: 1,
            remote: 2,
        };
        assert!(e.to_string().contains("local 1"));
        assert!(e.to_string().contains("remote 2"));

        let e = SyncError::DuplicateHostId(0xdead_beef);
        assert!(e.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(SyncError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(SyncError::PeerDisconnected(7).is_recoverable());
        assert!(!SyncError::ConnectionFailed("declined".into()).is_recoverable());
        assert!(!SyncError::Decode("truncated".into()).is_recoverable());
    }

    #[test]
    fn protocol_violation_classification() {
        let e = SyncError::UnknownVariant {
            type_name: "frame",
            value: "Bogus".into(),
        };
        assert!(e.is_protocol_violation());
        assert!(!SyncError::NotSeeded.is_protocol_violation());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let e: SyncError = io_err.into();
        assert!(matches!(e, SyncError::Io(_)));
    }
}
