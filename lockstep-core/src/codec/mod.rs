//! Self-describing binary codec for [`Value`]s.
//!
//! ## Wire format
//!
//! Every value starts with a one-byte tag:
//!
//! ```text
//! N                      null, no payload
//! t | l  len:u32  item*  tuple / list, each item recursively encoded
//! s      len:u32  bytes  byte string
//! d      t-sequence      mapping, as a tuple of (key, value) tuples
//! I      i32             integer in [-2^31, 2^31), little-endian
//! L      neg:u8 len:u32  integer outside that range, big-endian magnitude
//! F      f64             IEEE-754 double, little-endian
//! ```
//!
//! [`dumps`] / [`loads`] wrap the raw encoding in zstd compression.

mod value;

use std::io::Read;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::SyncError;

pub use value::Value;

// ── Constants ────────────────────────────────────────────────────

pub const TAG_NULL: u8 = b'N';
pub const TAG_TUPLE: u8 = b't';
pub const TAG_LIST: u8 = b'l';
pub const TAG_BYTES: u8 = b's';
pub const TAG_DICT: u8 = b'd';
pub const TAG_INT: u8 = b'I';
pub const TAG_LONG: u8 = b'L';
pub const TAG_FLOAT: u8 = b'F';

/// Deepest nesting the decoder accepts.
pub const MAX_DEPTH: usize = 64;

/// Upper bound on a decompressed datagram.
pub const MAX_DECODED_SIZE: usize = 1 << 20;

const COMPRESSION_LEVEL: i32 = 1;

// ── Encoding ─────────────────────────────────────────────────────

/// Append the tagged encoding of `value` to `dst`.
pub fn encode_value(value: &Value, dst: &mut BytesMut) -> Result<(), SyncError> {
    match value {
        Value::Null => dst.put_u8(TAG_NULL),
        Value::Tuple(items) => encode_seq(TAG_TUPLE, items, dst)?,
        Value::List(items) => encode_seq(TAG_LIST, items, dst)?,
        Value::Bytes(bytes) => {
            dst.put_u8(TAG_BYTES);
            dst.put_u32_le(length_prefix(bytes.len())?);
            dst.put_slice(bytes);
        }
        Value::Dict(pairs) => {
            dst.put_u8(TAG_DICT);
            dst.put_u8(TAG_TUPLE);
            dst.put_u32_le(length_prefix(pairs.len())?);
            for (key, val) in pairs {
                dst.put_u8(TAG_TUPLE);
                dst.put_u32_le(2);
                encode_value(key, dst)?;
                encode_value(val, dst)?;
            }
        }
        Value::Int(i) => match i32::try_from(*i) {
            Ok(small) => {
                dst.put_u8(TAG_INT);
                dst.put_i32_le(small);
            }
            Err(_) => {
                let magnitude = i.unsigned_abs().to_be_bytes();
                let first = magnitude.iter().position(|b| *b != 0).unwrap_or(magnitude.len());
                let magnitude = &magnitude[first..];
                dst.put_u8(TAG_LONG);
                dst.put_u8(u8::from(*i < 0));
                dst.put_u32_le(length_prefix(magnitude.len())?);
                dst.put_slice(magnitude);
            }
        },
        Value::Float(f) => {
            dst.put_u8(TAG_FLOAT);
            dst.put_f64_le(*f);
        }
    }
    Ok(())
}

fn encode_seq(tag: u8, items: &[Value], dst: &mut BytesMut) -> Result<(), SyncError> {
    dst.put_u8(tag);
    dst.put_u32_le(length_prefix(items.len())?);
    for item in items {
        encode_value(item, dst)?;
    }
    Ok(())
}

fn length_prefix(len: usize) -> Result<u32, SyncError> {
    u32::try_from(len).map_err(|_| SyncError::Encode(format!("length {len} exceeds u32 range")))
}

// ── Decoding ─────────────────────────────────────────────────────

/// Decode one value from the front of `src`, advancing it.
pub fn decode_value(src: &mut &[u8]) -> Result<Value, SyncError> {
    decode_at(src, 0)
}

fn decode_at(src: &mut &[u8], depth: usize) -> Result<Value, SyncError> {
    if depth > MAX_DEPTH {
        return Err(SyncError::Decode(format!("nesting deeper than {MAX_DEPTH}")));
    }
    let tag = take_u8(src)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_TUPLE | TAG_LIST => {
            let len = take_len(src)?;
            // Every element occupies at least its tag byte.
            if len > src.remaining() {
                return Err(truncated("sequence", len, src.remaining()));
            }
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_at(src, depth + 1)?);
            }
            Ok(if tag == TAG_TUPLE {
                Value::Tuple(items)
            } else {
                Value::List(items)
            })
        }
        TAG_BYTES => {
            let len = take_len(src)?;
            if len > src.remaining() {
                return Err(truncated("byte string", len, src.remaining()));
            }
            let bytes = src[..len].to_vec();
            src.advance(len);
            Ok(Value::Bytes(bytes))
        }
        TAG_DICT => {
            let pairs = decode_at(src, depth + 1)?
                .into_seq()
                .ok_or_else(|| SyncError::Decode("mapping is not a sequence".into()))?;
            pairs
                .into_iter()
                .map(|pair| match pair.into_seq() {
                    Some(kv) if kv.len() == 2 => {
                        let mut kv = kv.into_iter();
                        match (kv.next(), kv.next()) {
                            (Some(k), Some(v)) => Ok((k, v)),
                            _ => Err(SyncError::Decode("mapping entry is not a pair".into())),
                        }
                    }
                    _ => Err(SyncError::Decode("mapping entry is not a pair".into())),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Dict)
        }
        TAG_INT => {
            need(src, 4, "int")?;
            Ok(Value::Int(i128::from(src.get_i32_le())))
        }
        TAG_LONG => {
            let negative = take_u8(src)? != 0;
            let len = take_len(src)?;
            if len > src.remaining() {
                return Err(truncated("long magnitude", len, src.remaining()));
            }
            let raw = &src[..len];
            let first = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
            let digits = &raw[first..];
            if digits.len() > 16 {
                return Err(SyncError::Decode(format!(
                    "long magnitude of {} bytes exceeds 128 bits",
                    digits.len()
                )));
            }
            let mut buf = [0u8; 16];
            buf[16 - digits.len()..].copy_from_slice(digits);
            src.advance(len);
            long_from_parts(negative, u128::from_be_bytes(buf)).map(Value::Int)
        }
        TAG_FLOAT => {
            need(src, 8, "float")?;
            Ok(Value::Float(src.get_f64_le()))
        }
        other => Err(SyncError::Decode(format!("unknown tag {:#04x}", other))),
    }
}

fn long_from_parts(negative: bool, magnitude: u128) -> Result<i128, SyncError> {
    const MIN_MAGNITUDE: u128 = 1 << 127;
    match (negative, magnitude) {
        (true, m) if m == MIN_MAGNITUDE => Ok(i128::MIN),
        (true, m) if m < MIN_MAGNITUDE => Ok(-(m as i128)),
        (false, m) if m < MIN_MAGNITUDE => Ok(m as i128),
        _ => Err(SyncError::Decode("long value exceeds 128-bit range".into())),
    }
}

fn take_u8(src: &mut &[u8]) -> Result<u8, SyncError> {
    need(src, 1, "tag")?;
    Ok(src.get_u8())
}

fn take_len(src: &mut &[u8]) -> Result<usize, SyncError> {
    need(src, 4, "length")?;
    Ok(src.get_u32_le() as usize)
}

fn need(src: &[u8], n: usize, what: &str) -> Result<(), SyncError> {
    if src.remaining() < n {
        return Err(truncated(what, n, src.remaining()));
    }
    Ok(())
}

fn truncated(what: &str, wanted: usize, available: usize) -> SyncError {
    SyncError::Decode(format!(
        "truncated {what}: need {wanted} bytes, {available} left"
    ))
}

// ── Top level ────────────────────────────────────────────────────

/// Encode `value` without compression.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, SyncError> {
    let mut buf = BytesMut::new();
    encode_value(value, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode a complete uncompressed value; trailing bytes are an error.
pub fn from_bytes(mut data: &[u8]) -> Result<Value, SyncError> {
    let value = decode_value(&mut data)?;
    if !data.is_empty() {
        return Err(SyncError::Decode(format!(
            "{} trailing bytes after value",
            data.len()
        )));
    }
    Ok(value)
}

/// Encode and compress `value` into one datagram payload.
pub fn dumps(value: &Value) -> Result<Vec<u8>, SyncError> {
    let raw = to_bytes(value)?;
    zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| SyncError::Encode(format!("compression failed: {e}")))
}

/// Decompress and decode a datagram payload produced by [`dumps`].
pub fn loads(data: &[u8]) -> Result<Value, SyncError> {
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| SyncError::Decode(format!("decompression failed: {e}")))?;
    let mut raw = Vec::new();
    decoder
        .take(MAX_DECODED_SIZE as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| SyncError::Decode(format!("decompression failed: {e}")))?;
    if raw.len() > MAX_DECODED_SIZE {
        return Err(SyncError::Decode(format!(
            "decompressed payload exceeds {MAX_DECODED_SIZE} bytes"
        )));
    }
    from_bytes(&raw)
}

// ── Tests ────────────────────────────────────────────────────────
