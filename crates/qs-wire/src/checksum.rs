//! Content checksums and subscription fingerprints.
//!
//! Both are SipHash-1-3 with fixed keys: fast, stable across processes, and
//! not cryptographic. Object members are hashed one by one and folded with a
//! wrapping sum so key order never changes the result.

use std::hash::Hasher;

use serde_json::Value;
use siphasher::sip::SipHasher13;

use crate::payload::Payload;

const CHECKSUM_KEYS: (u64, u64) = (0x7173_2d63_6865_636b, 0x5155_414e_5455_4d31);
const FINGERPRINT_KEYS: (u64, u64) = (0x7173_2d66_696e_6765, 0x5155_414e_5455_4d32);

/// Separator between the route name and payload checksum in a fingerprint.
const NAME_SEPARATOR: u8 = 0xff;

fn hasher(keys: (u64, u64)) -> SipHasher13 {
    SipHasher13::new_with_keys(keys.0, keys.1)
}

/// `0` is reserved for "no value yet".
fn nonzero(hash: u64) -> u64 {
    if hash == 0 {
        1
    } else {
        hash
    }
}

fn write_value(h: &mut SipHasher13, value: &Value) {
    match value {
        Value::Null => h.write_u8(0),
        Value::Bool(b) => {
            h.write_u8(1);
            h.write_u8(*b as u8);
        }
        Value::Number(n) => {
            h.write_u8(2);
            // 1 and 1.0 hash the same
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => h.write_i64(f as i64),
                Some(f) => h.write_u64(f.to_bits()),
                None => h.write(n.to_string().as_bytes()),
            }
        }
        Value::String(s) => {
            h.write_u8(3);
            h.write_usize(s.len());
            h.write(s.as_bytes());
        }
        Value::Array(items) => {
            h.write_u8(4);
            h.write_usize(items.len());
            for item in items {
                write_value(h, item);
            }
        }
        Value::Object(map) => {
            h.write_u8(5);
            h.write_usize(map.len());
            let folded = map.iter().fold(0u64, |acc, (key, member)| {
                let mut m = hasher(CHECKSUM_KEYS);
                m.write_usize(key.len());
                m.write(key.as_bytes());
                write_value(&mut m, member);
                acc.wrapping_add(m.finish())
            });
            h.write_u64(folded);
        }
    }
}

/// Checksum of a JSON value. Never returns `0`.
pub fn hash_json(value: &Value) -> u64 {
    let mut h = hasher(CHECKSUM_KEYS);
    write_value(&mut h, value);
    nonzero(h.finish())
}

/// Checksum of any payload. Never returns `0`.
pub fn hash_payload(payload: &Payload) -> u64 {
    match payload {
        Payload::Json(v) => hash_json(v),
        Payload::Null => hash_json(&Value::Null),
        other => {
            let mut h = hasher(CHECKSUM_KEYS);
            h.write_u8(0x10 | other.content_type().tag());
            h.write(&other.encode_bytes());
            nonzero(h.finish())
        }
    }
}

/// Stable table key for a (route name, payload) pair. Never returns `0`.
pub fn fingerprint(name: &str, payload: &Payload) -> u64 {
    let mut h = hasher(FINGERPRINT_KEYS);
    h.write(name.as_bytes());
    h.write_u8(NAME_SEPARATOR);
    h.write_u64(hash_payload(payload));
    nonzero(h.finish())
}
