//! The closed set of values that travel on the wire.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::SyncError;

/// A self-describing wire value.
///
/// `Tuple` and `List` carry the same data; the distinction only exists so
/// a decoded value compares equal to the one that was encoded. `Dict`
/// keeps its pairs in insertion order, which keeps encoding deterministic
/// without requiring keys to be orderable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Bytes(Vec<u8>),
    Dict(Vec<(Value, Value)>),
    Int(i128),
    Float(f64),
}

impl Value {
    /// A byte string holding the UTF-8 encoding of `s`.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Bytes(s.into().into_bytes())
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Bytes(_) => "bytes",
            Value::Dict(_) => "dict",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Elements of a tuple or list.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_seq(self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(pairs) => Some(pairs),
            _ => None,
        }
    }
}

// ── Typed extraction ─────────────────────────────────────────────

impl Value {
    /// Integer converted to `T`, or a decode error naming `what`.
    pub fn to_int<T: TryFrom<i128>>(&self, what: &str) -> Result<T, SyncError> {
        let raw = self.as_int().ok_or_else(|| mismatch(what, "int", self))?;
        T::try_from(raw).map_err(|_| SyncError::Decode(format!("{what} out of range: {raw}")))
    }

    /// UTF-8 byte string as an owned `String`.
    pub fn to_string_field(&self, what: &str) -> Result<String, SyncError> {
        let bytes = self.as_bytes().ok_or_else(|| mismatch(what, "bytes", self))?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Elements of a tuple or list of any length.
    pub fn into_items(self, what: &str) -> Result<Vec<Value>, SyncError> {
        match self {
            Value::Tuple(items) | Value::List(items) => Ok(items),
            other => Err(mismatch(what, "sequence", &other)),
        }
    }

    /// Elements of a tuple or list holding exactly `N` values.
    pub fn into_array<const N: usize>(self, what: &str) -> Result<[Value; N], SyncError> {
        let items = self.into_items(what)?;
        let len = items.len();
        items
            .try_into()
            .map_err(|_| SyncError::Decode(format!("{what}: expected {N} elements, got {len}")))
    }

    /// Socket address encoded as `(ip text, port)`.
    pub fn address(addr: SocketAddr) -> Self {
        Value::tuple([Value::str(addr.ip().to_string()), Value::from(addr.port())])
    }

    pub fn to_address(&self, what: &str) -> Result<SocketAddr, SyncError> {
        let [ip, port] = self.clone().into_array(what)?;
        let ip: IpAddr = ip
            .to_string_field(what)?
            .parse()
            .map_err(|e| SyncError::Decode(format!("{what}: bad ip address: {e}")))?;
        Ok(SocketAddr::new(ip, port.to_int(what)?))
    }
}

fn mismatch(what: &str, expected: &str, got: &Value) -> SyncError {
    SyncError::Decode(format!("{what}: expected {expected}, got {}", got.kind()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "b{b:?}"),
            },
            Value::Tuple(items) | Value::List(items) => {
                let (open, close) = if matches!(self, Value::Tuple(_)) {
                    ('(', ')')
                } else {
                    ('[', ']')
                };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
            Value::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────

macro_rules! int_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(v as i128)
                }
            }
        )*
    };
}

int_from!(i8, i16, i32, i64, i128, u8, u16, u32, u64);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(v.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
