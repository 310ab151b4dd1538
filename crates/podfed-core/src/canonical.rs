//! Canonical CBOR encoding for deterministic serialization.
//!
//! This module implements RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (timestamps are integer milliseconds)
//!
//! Two places depend on byte-identical output across pods: the message a
//! friend request signature covers, and the per-record bytes hashed into a
//! catalog digest.
//!
//! Non-canonical storage encoding (the outbound queue) goes through
//! [`encode_cbor`] / [`decode_cbor`], which wrap ciborium's serde support.

use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};

use crate::crypto::Ed25519PublicKey;
use crate::error::CoreError;
use crate::types::{PodHost, Stamp};
use crate::video::VideoRecord;

/// Domain separator for friend request signatures.
const FRIEND_REQUEST_DOMAIN: &str = "podfed/friend-request/v1";

/// Field keys (integer keys for compact encoding).
///
/// Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub mod request {
        pub const DOMAIN: u64 = 0;
        pub const FROM: u64 = 1;
        pub const TO: u64 = 2;
        pub const REQUESTED_AT: u64 = 3;
        pub const PUBLIC_KEY: u64 = 4;
    }

    pub mod record {
        pub const UUID: u64 = 0;
        pub const NAME: u64 = 1;
        pub const DESCRIPTION: u64 = 2;
        pub const TAGS: u64 = 3;
        pub const DURATION: u64 = 4;
        pub const AUTHOR: u64 = 5;
        pub const ORIGIN: u64 = 6;
        pub const CONTENT_ID: u64 = 7;
        pub const THUMBNAIL: u64 = 8;
        pub const VIEWS: u64 = 9;
        pub const CREATED_AT: u64 = 10;
        pub const TOMBSTONED: u64 = 11;
        pub const STAMPS: u64 = 12;
    }
}

/// The message a friend request signature covers.
pub fn friend_request_signing_bytes(
    from: &PodHost,
    to: &PodHost,
    requested_at: i64,
    public_key: &Ed25519PublicKey,
) -> Vec<u8> {
    use keys::request as k;
    let value = Value::Map(vec![
        (int(k::DOMAIN), Value::Text(FRIEND_REQUEST_DOMAIN.into())),
        (int(k::FROM), Value::Text(from.to_string())),
        (int(k::TO), Value::Text(to.to_string())),
        (int(k::REQUESTED_AT), Value::Integer(requested_at.into())),
        (int(k::PUBLIC_KEY), Value::Bytes(public_key.0.to_vec())),
    ]);
    let mut buf = Vec::new();
    // Built from integers, text and bytes only; cannot hit an unsupported type.
    let _ = encode_value_to(&mut buf, &value);
    buf
}

/// Canonical bytes of the replicated content of a video record.
///
/// `updated_at` is excluded: it is bookkeeping that each pod sets on its own
/// clock and is not part of the converged state.
pub fn canonical_record_bytes(record: &VideoRecord) -> Result<Vec<u8>, CoreError> {
    use keys::record as k;
    let tags = record.tags.iter().map(|t| Value::Text(t.clone())).collect();
    let stamps = Value::Array(vec![
        stamp_value(&record.stamps.name),
        stamp_value(&record.stamps.description),
        stamp_value(&record.stamps.tags),
        stamp_value(&record.stamps.metadata),
    ]);

    let value = Value::Map(vec![
        (int(k::UUID), Value::Bytes(record.uuid.as_bytes().to_vec())),
        (int(k::NAME), Value::Text(record.name.clone())),
        (int(k::DESCRIPTION), Value::Text(record.description.clone())),
        (int(k::TAGS), Value::Array(tags)),
        (int(k::DURATION), Value::Integer(record.duration.into())),
        (int(k::AUTHOR), Value::Text(record.author.clone())),
        (int(k::ORIGIN), Value::Text(record.origin.to_string())),
        (int(k::CONTENT_ID), Value::Text(record.content_id.to_string())),
        (int(k::THUMBNAIL), Value::Text(record.thumbnail_path.clone())),
        (int(k::VIEWS), Value::Integer(record.views.into())),
        (int(k::CREATED_AT), Value::Integer(record.created_at.into())),
        (int(k::TOMBSTONED), Value::Bool(record.tombstoned)),
        (int(k::STAMPS), stamps),
    ]);

    let mut buf = Vec::new();
    encode_value_to(&mut buf, &value)?;
    Ok(buf)
}

/// Serialize any serde value to CBOR.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a serde value from CBOR.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

fn int(key: u64) -> Value {
    Value::Integer(key.into())
}

fn stamp_value(stamp: &Stamp) -> Value {
    Value::Array(vec![
        Value::Integer(stamp.timestamp.as_u64().into()),
        Value::Text(stamp.origin.to_string()),
    ])
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr)?,
        Value::Map(entries) => encode_map_canonical(buf, entries)?,
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(_) => {
            return Err(CoreError::EncodingError(
                "floats not supported in canonical encoding".into(),
            ))
        }
        _ => {
            return Err(CoreError::EncodingError(
                "unsupported CBOR value type".into(),
            ))
        }
    }
    Ok(())
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffffffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) -> Result<(), CoreError> {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item)?;
    }
    Ok(())
}

/// Encode a map canonically (major type 5).
///
/// Keys are sorted by their encoded byte comparison.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<(), CoreError> {
    let mut key_value_pairs = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let mut key_buf = Vec::new();
        encode_value_to(&mut key_buf, k)?;
        key_value_pairs.push((key_buf, v));
    }

    key_value_pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, key_value_pairs.len() as u64);
    for (key_bytes, value) in key_value_pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value)?;
    }
    Ok(())
}
