//! Datagram frames.
//!
//! Every tagged frame is a two-element tuple whose first element is the
//! tag. The identification datagram is the one untagged message.
//!
//! ```text
//!  ("Actions",        (executed, {scheduled: [action...]}))
//!  ("WELCOME!",       (publicized_data, [(id, name)...]))
//!  ("NOTCONNECTING!", ())
//!  ("listening_on",   [port...])
//!  ("Goodbye",        (executed, last_scheduled, {scheduled: [action...]}))
//!
//!  (protocol_version, host_id, host_name)             identification
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::action::Action;
use crate::codec::{self, Value};
use crate::error::SyncError;
use crate::host::{Host, HostId};

/// Unacknowledged actions keyed by scheduled iteration.
pub type Backlog = BTreeMap<u64, Vec<Action>>;

const TAG_ACTIONS: &str = "Actions";
const TAG_WELCOME: &str = "WELCOME!";
const TAG_NOT_CONNECTING: &str = "NOTCONNECTING!";
const TAG_LISTENING_ON: &str = "listening_on";
const TAG_GOODBYE: &str = "Goodbye";

// ── Frame ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Steady-state traffic: the sender's whole unacknowledged backlog.
    Actions { executed: u64, backlog: Backlog },

    /// Admission offer from the listener.
    Welcome {
        publicized_data: Value,
        hosts: Vec<Host>,
    },

    /// The listener declined or stopped accepting.
    NotConnecting,

    /// One freshly bound port per host listed in the welcome, same order.
    ListeningOn { ports: Vec<u16> },

    /// The sender leaves after executing `last_scheduled`.
    Goodbye {
        executed: u64,
        last_scheduled: u64,
        backlog: Backlog,
    },
}

impl Frame {
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Actions { .. } => TAG_ACTIONS,
            Frame::Welcome { .. } => TAG_WELCOME,
            Frame::NotConnecting => TAG_NOT_CONNECTING,
            Frame::ListeningOn { .. } => TAG_LISTENING_ON,
            Frame::Goodbye { .. } => TAG_GOODBYE,
        }
    }

    pub fn to_value(&self) -> Value {
        let payload = match self {
            Frame::Actions { executed, backlog } => {
                Value::tuple([Value::from(*executed), backlog_to_value(backlog)])
            }
            Frame::Welcome {
                publicized_data,
                hosts,
            } => Value::tuple([
                publicized_data.clone(),
                Value::list(hosts.iter().map(|h| {
                    Value::tuple([Value::from(h.id), Value::str(h.name.as_str())])
                })),
            ]),
            Frame::NotConnecting => Value::tuple([]),
            Frame::ListeningOn { ports } => Value::list(ports.iter().map(|p| Value::from(*p))),
            Frame::Goodbye {
                executed,
                last_scheduled,
                backlog,
            } => Value::tuple([
                Value::from(*executed),
                Value::from(*last_scheduled),
                backlog_to_value(backlog),
            ]),
        };
        Value::tuple([Value::str(self.tag()), payload])
    }

    /// Compressed datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        codec::dumps(&self.to_value())
    }

    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        Frame::try_from(codec::loads(data)?)
    }
}

impl TryFrom<Value> for Frame {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let [tag, payload] = value.into_array("frame")?;
        let tag = tag.to_string_field("frame tag")?;
        match tag.as_str() {
            TAG_ACTIONS => {
                let [executed, backlog] = payload.into_array("actions payload")?;
                Ok(Frame::Actions {
                    executed: executed.to_int("executed iteration")?,
                    backlog: backlog_from_value(backlog)?,
                })
            }
            TAG_WELCOME => {
                let [publicized_data, hosts] = payload.into_array("welcome payload")?;
                let hosts = hosts
                    .into_items("host list")?
                    .into_iter()
                    .map(|entry| -> Result<Host, SyncError> {
                        let [id, name] = entry.into_array("host entry")?;
                        Ok(Host::new(id.to_int("host id")?, name.to_string_field("host name")?))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Frame::Welcome {
                    publicized_data,
                    hosts,
                })
            }
            TAG_NOT_CONNECTING => Ok(Frame::NotConnecting),
            TAG_LISTENING_ON => Ok(Frame::ListeningOn {
                ports: payload
                    .into_items("port list")?
                    .iter()
                    .map(|p| p.to_int::<u16>("port"))
                    .collect::<Result<Vec<_>, _>>()?,
            }),
            TAG_GOODBYE => {
                let [executed, last_scheduled, backlog] = payload.into_array("goodbye payload")?;
                Ok(Frame::Goodbye {
                    executed: executed.to_int("executed iteration")?,
                    last_scheduled: last_scheduled.to_int("last scheduled iteration")?,
                    backlog: backlog_from_value(backlog)?,
                })
            }
            other => Err(SyncError::UnknownVariant {
                type_name: "frame",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

fn backlog_to_value(backlog: &Backlog) -> Value {
    Value::Dict(
        backlog
            .iter()
            .map(|(iteration, actions)| {
                (
                    Value::from(*iteration),
                    Value::list(actions.iter().map(Action::to_value)),
                )
            })
            .collect(),
    )
}

fn backlog_from_value(value: Value) -> Result<Backlog, SyncError> {
    let pairs = value
        .into_dict()
        .ok_or_else(|| SyncError::Decode("backlog: expected dict".into()))?;
    let mut backlog = Backlog::new();
    for (iteration, actions) in pairs {
        let actions = actions
            .into_items("action list")?
            .into_iter()
            .map(Action::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        backlog.insert(iteration.to_int("scheduled iteration")?, actions);
    }
    Ok(backlog)
}

// ── Identification ───────────────────────────────────────────────

/// First datagram a connector sends to the rendezvous socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub protocol_version: u32,
    pub host_id: HostId,
    pub host_name: String,
}

impl Identification {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        codec::dumps(&Value::tuple([
            Value::from(self.protocol_version),
            Value::from(self.host_id),
            Value::str(self.host_name.as_str()),
        ]))
    }

    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        let [version, id, name] = codec::loads(data)?.into_array("identification")?;
        Ok(Self {
            protocol_version: version.to_int("protocol version")?,
            host_id: id.to_int("host id")?,
            host_name: name.to_string_field("host name")?,
        })
    }
}
