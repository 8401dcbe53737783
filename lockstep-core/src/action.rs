//! Actions scheduled for execution at one logical iteration.
//!
//! Gameplay commands and protocol commands share the same channel. On
//! the wire both are a `(name, args)` pair; protocol commands carry the
//! [`INTERNAL_PREFIX`] and are consumed by the engine instead of being
//! handed to the application.
//!
//! ```text
//!  ("jump", [3, 4])                                   user action
//!  ("INTERNAL_reset_random_seed", [])                 reseed everyone
//!  ("INTERNAL_connect_to", [id, name, orig, addr])    admit a peer
//! ```

use std::fmt;
use std::net::SocketAddr;

use crate::codec::Value;
use crate::error::SyncError;
use crate::host::HostId;

/// Names starting with this are reserved for protocol commands.
pub const INTERNAL_PREFIX: &str = "INTERNAL_";

const RESET_RANDOM_SEED: &str = "INTERNAL_reset_random_seed";
const CONNECT_TO: &str = "INTERNAL_connect_to";

// ── UserAction ───────────────────────────────────────────────────

/// An application-defined command, opaque to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAction {
    pub name: String,
    pub args: Vec<Value>,
}

impl UserAction {
    /// Build a user action, refusing names in the internal namespace.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Result<Self, SyncError> {
        let name = name.into();
        if name.starts_with(INTERNAL_PREFIX) {
            return Err(SyncError::ReservedActionName(name));
        }
        Ok(Self { name, args })
    }
}

// ── InternalAction ───────────────────────────────────────────────

/// Protocol commands executed by the engine itself.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalAction {
    /// Derive a fresh shared seed from the iteration count and host ids.
    ResetRandomSeed,

    /// Open a peer socket towards a newly admitted host.
    ConnectTo {
        remote_id: HostId,
        remote_name: String,
        /// Address the joining host used on the rendezvous socket.
        original_address: SocketAddr,
        /// Per-host port the joining host opened for the receiver.
        address: SocketAddr,
    },
}

impl InternalAction {
    pub fn name(&self) -> &'static str {
        match self {
            InternalAction::ResetRandomSeed => RESET_RANDOM_SEED,
            InternalAction::ConnectTo { .. } => CONNECT_TO,
        }
    }

    fn args(&self) -> Vec<Value> {
        match self {
            InternalAction::ResetRandomSeed => Vec::new(),
            InternalAction::ConnectTo {
                remote_id,
                remote_name,
                original_address,
                address,
            } => vec![
                Value::from(*remote_id),
                Value::str(remote_name.as_str()),
                Value::address(*original_address),
                Value::address(*address),
            ],
        }
    }

    fn from_parts(name: &str, args: Vec<Value>) -> Result<Self, SyncError> {
        match name {
            RESET_RANDOM_SEED => Ok(InternalAction::ResetRandomSeed),
            CONNECT_TO => {
                let [id, remote_name, original, address] =
                    Value::List(args).into_array("connect_to arguments")?;
                Ok(InternalAction::ConnectTo {
                    remote_id: id.to_int("remote id")?,
                    remote_name: remote_name.to_string_field("remote name")?,
                    original_address: original.to_address("original address")?,
                    address: address.to_address("address")?,
                })
            }
            other => Err(SyncError::UnknownVariant {
                type_name: "internal action",
                value: other.to_string(),
            }),
        }
    }
}

// ── Action ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    User(UserAction),
    Internal(InternalAction),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::User(a) => &a.name,
            Action::Internal(a) => a.name(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Action::Internal(_))
    }

    /// Wire form: `(name, [args...])`.
    pub fn to_value(&self) -> Value {
        let args = match self {
            Action::User(a) => a.args.clone(),
            Action::Internal(a) => a.args(),
        };
        Value::tuple([Value::str(self.name()), Value::List(args)])
    }
}

impl TryFrom<Value> for Action {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let [name, args] = value.into_array("action")?;
        let name = name.to_string_field("action name")?;
        let args = args.into_items("action arguments")?;
        if name.starts_with(INTERNAL_PREFIX) {
            InternalAction::from_parts(&name, args).map(Action::Internal)
        } else {
            Ok(Action::User(UserAction { name, args }))
        }
    }
}

impl From<UserAction> for Action {
    fn from(a: UserAction) -> Self {
        Action::User(a)
    }
}

impl From<InternalAction> for Action {
    fn from(a: InternalAction) -> Self {
        Action::Internal(a)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}
