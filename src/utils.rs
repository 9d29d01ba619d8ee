use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The number of bytes used for the version header of a stored node.
pub const VERSION_HEADER_LEN: usize = 8;

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode a node's data prefixed with its version.
///
/// NOTE: all node values in the coordination store are encoded this way, the version header is
/// what conditional writes are checked against.
pub fn encode_versioned(version: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_HEADER_LEN + data.len());
    buf.extend_from_slice(&encode_u64(version));
    buf.extend_from_slice(data);
    buf
}

/// Decode a node's version & data.
pub fn decode_versioned(val: &[u8]) -> Result<(u64, &[u8])> {
    if val.len() < VERSION_HEADER_LEN {
        bail!("invalid versioned node, expected at least {} bytes, got {}", VERSION_HEADER_LEN, val.len());
    }
    let version = decode_u64(&val[..VERSION_HEADER_LEN])?;
    Ok((version, &val[VERSION_HEADER_LEN..]))
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from coordination store")
}

/// Parse the trailing path segment of the given key as a number.
pub fn parse_key_suffix<T: std::str::FromStr>(key: &str, prefix: &str) -> Option<T> {
    key.strip_prefix(prefix).and_then(|suffix| suffix.parse().ok())
}

/// Add up to 100% random jitter to the given backoff.
///
/// Replicas retrying in lockstep after the same cancellation would otherwise keep cancelling
/// each other.
pub fn jittered(backoff: Duration) -> Duration {
    let max_ms = backoff.as_millis() as u64;
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
