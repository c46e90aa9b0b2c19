use std::iter::FromIterator;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::IVec;

/// Encode a byte + i64 prefix key.
///
/// This allows for efficient BTree prefix storage without the overhead of allocating additional
/// vectors, strings or other sorts of buffers.
///
/// NOTE: if any data in a tree is encoded with a prefix, then all data in that tree will need
/// to be encoded with a well-defined prefix as well in order to avoid unintended collisions
/// and or data corruption.
pub fn encode_byte_prefix_i64(prefix: &[u8; 1], ts: i64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix[0];
    match encode_i64(ts) {
        [b1, b2, b3, b4, b5, b6, b7, b8] => {
            key[1] = b1;
            key[2] = b2;
            key[3] = b3;
            key[4] = b4;
            key[5] = b5;
            key[6] = b6;
            key[7] = b7;
            key[8] = b8;
        }
    }
    key
}

/// Encode a byte prefix + i64 timestamp + id suffix key.
///
/// Keys of this shape sort by timestamp first, which gives time-ordered range scans over the
/// prefix, while the id suffix keeps keys unique across records sharing a timestamp.
pub fn encode_ts_id_key(prefix: &[u8; 1], ts: i64, id: &str) -> IVec {
    ivec_from_iter(
        encode_byte_prefix_i64(prefix, ts)
            .iter()
            .copied()
            .chain(id.as_bytes().iter().copied()),
    )
}

/// Encode a byte prefix + id key.
pub fn encode_id_key(prefix: &[u8; 1], id: &str) -> IVec {
    ivec_from_iter(prefix.iter().copied().chain(id.as_bytes().iter().copied()))
}

/// Encode the given i64 as an array of big-endian bytes.
pub fn encode_i64(val: i64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a i64.
pub fn decode_i64(val: &[u8]) -> Result<i64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(i64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as i64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from storage")
}

/// Encode the given bytes iterator as an IVec.
pub fn ivec_from_iter<T: IntoIterator<Item = u8>>(data: T) -> IVec {
    IVec::from_iter(data)
}

/// The current time as unix seconds.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
