//! Table and index key codec.
//!
//! Layout (all integers sign-flipped big-endian so byte order equals
//! numeric order):
//!
//! ```text
//! record key:   't' <table_id:8> '_' 'r' <handle:8> [column-family suffix]
//! index prefix: 't' <table_id:8> '_' 'i' <index_id:8>
//! ```
//!
//! Row payloads are serde_json maps of column id → datum. Index key
//! suffixes use an order-preserving tagged datum encoding.

use std::collections::BTreeMap;

use kestrel_common::datum::Datum;
use kestrel_common::error::KvError;
use kestrel_common::types::{ColumnKind, Handle, IndexId, TableId};

const TABLE_PREFIX: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";

/// Record key length without any column-family suffix.
const RECORD_KEY_LEN: usize = 1 + 8 + 2 + 8;

fn encode_i64(v: i64, buf: &mut Vec<u8>) {
    let flipped = (v as u64) ^ (1u64 << 63);
    buf.extend_from_slice(&flipped.to_be_bytes());
}

fn decode_i64(bytes: &[u8]) -> Result<i64, KvError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| KvError::Codec("truncated i64".into()))?;
    Ok((u64::from_be_bytes(arr) ^ (1u64 << 63)) as i64)
}

/// Prefix covering every record key of `table_id`.
pub fn encode_table_record_prefix(table_id: TableId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_KEY_LEN);
    buf.push(TABLE_PREFIX);
    encode_i64(table_id.0, &mut buf);
    buf.extend_from_slice(RECORD_SEP);
    buf
}

/// Key of the base row identified by `handle`.
pub fn encode_record_key(table_id: TableId, handle: Handle) -> Vec<u8> {
    let mut buf = encode_table_record_prefix(table_id);
    encode_i64(handle, &mut buf);
    buf
}

/// Prefix covering every entry of index `index_id` in `table_id`.
pub fn encode_table_index_prefix(table_id: TableId, index_id: IndexId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_KEY_LEN);
    buf.push(TABLE_PREFIX);
    encode_i64(table_id.0, &mut buf);
    buf.extend_from_slice(INDEX_SEP);
    encode_i64(index_id.0, &mut buf);
    buf
}

/// Extract the handle from a record key. Column-family suffixes after the
/// handle are ignored.
pub fn decode_row_key(key: &[u8]) -> Result<Handle, KvError> {
    if key.len() < RECORD_KEY_LEN
        || key[0] != TABLE_PREFIX
        || &key[9..11] != RECORD_SEP
    {
        return Err(KvError::Codec(format!(
            "not a record key ({} bytes)",
            key.len()
        )));
    }
    decode_i64(&key[11..RECORD_KEY_LEN])
}

// ── datum encoding ───────────────────────────────────────────────────

/// Append an order-preserving encoding of `datum` to `buf`: a tag byte,
/// then sign-flipped big-endian for numerics, terminated bytes for
/// strings, length-prefixed bytes for binary.
pub fn encode_datum(datum: &Datum, buf: &mut Vec<u8>) {
    match datum {
        Datum::Null => buf.push(0x00),
        Datum::Int64(v) => {
            buf.push(0x03);
            encode_i64(*v, buf);
        }
        Datum::Float64(v) => {
            buf.push(0x04);
            let bits = v.to_bits();
            let encoded = if bits & (1u64 << 63) != 0 {
                !bits
            } else {
                bits ^ (1u64 << 63)
            };
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::Str(s) => {
            buf.push(0x05);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00);
        }
        Datum::Bytes(b) => {
            buf.push(0x06);
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
        }
    }
}

/// Encode an ordered tuple of index column values.
pub fn encode_index_values(values: &[Datum]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * values.len());
    for v in values {
        encode_datum(v, &mut buf);
    }
    buf
}

// ── handle values ────────────────────────────────────────────────────

/// Value payload of a unique index entry: the owning handle.
pub fn encode_handle_value(handle: Handle) -> Vec<u8> {
    handle.to_be_bytes().to_vec()
}

pub fn decode_handle_value(value: &[u8]) -> Result<Handle, KvError> {
    let arr: [u8; 8] = value
        .try_into()
        .map_err(|_| KvError::Codec("bad handle value".into()))?;
    Ok(i64::from_be_bytes(arr))
}

// ── row payloads ─────────────────────────────────────────────────────

/// Encode a row as a column-id → datum map.
pub fn encode_row(row: &BTreeMap<i64, Datum>) -> Result<Vec<u8>, KvError> {
    serde_json::to_vec(row).map_err(|e| KvError::Codec(e.to_string()))
}

/// Decode a row payload, keeping only the columns named in `cols`.
pub fn decode_row(
    bytes: &[u8],
    cols: &BTreeMap<i64, ColumnKind>,
) -> Result<BTreeMap<i64, Datum>, KvError> {
    let full: BTreeMap<i64, Datum> =
        serde_json::from_slice(bytes).map_err(|e| KvError::Codec(e.to_string()))?;
    Ok(full
        .into_iter()
        .filter(|(id, _)| cols.contains_key(id))
        .collect())
}
