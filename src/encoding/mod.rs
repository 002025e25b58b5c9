//! # Order-Preserving Tuple Encoding
//!
//! Keys in the B+tree are compared as plain byte strings, so every typed
//! tuple must serialize to bytes whose lexicographic order equals the
//! tuple's logical order. Two encodings make that hold:
//!
//! - **INT64**: biased by `1 << 63` and stored big-endian. Flipping the
//!   sign bit maps the signed range monotonically onto the unsigned range,
//!   and big-endian makes byte order match numeric order.
//! - **BYTES**: copied with `0x00` escaped to `0x01 0x01` and `0x01`
//!   escaped to `0x01 0x02`, then terminated by a single `0x00`. The
//!   terminator is unambiguous (no escaped sequence contains `0x00`) and
//!   sorts before every continuation byte, so a proper prefix orders
//!   before its extensions exactly as the raw strings do.
//!
//! A *keyspace key* is a big-endian `u32` table-or-index prefix followed by
//! the encoded primary-key tuple; the prefix partitions the single tree
//! keyspace. Non-key columns use the same tuple encoding without a prefix.
//!
//! Decoding is directed by the expected column types, which makes it
//! lossless for every encodable tuple.

use eyre::{ensure, Result};

use crate::records::{Value, ValueType};

const INT64_BIAS: u64 = 1 << 63;

/// Appends the tuple encoding of `vals` to `out`.
pub fn encode_values(out: &mut Vec<u8>, vals: &[Value]) {
    for val in vals {
        match val {
            Value::Int64(v) => {
                let biased = (*v as u64).wrapping_add(INT64_BIAS);
                out.extend_from_slice(&biased.to_be_bytes());
            }
            Value::Bytes(bytes) => {
                escape_into(out, bytes);
                out.push(0x00);
            }
        }
    }
}

/// Keyspace key: big-endian prefix followed by the encoded tuple.
pub fn encode_key(prefix: u32, vals: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + vals.len() * 9);
    out.extend_from_slice(&prefix.to_be_bytes());
    encode_values(&mut out, vals);
    out
}

/// Decodes a tuple of the given column types, consuming the whole buffer.
pub fn decode_values(data: &[u8], types: &[ValueType]) -> Result<Vec<Value>> {
    let mut vals = Vec::with_capacity(types.len());
    let mut pos = 0;
    for ty in types {
        match ty {
            ValueType::Int64 => {
                ensure!(
                    pos + 8 <= data.len(),
                    "truncated tuple: int64 column needs 8 bytes, {} left",
                    data.len() - pos
                );
                let biased = u64::from_be_bytes(data[pos..pos + 8].try_into().expect("8 bytes"));
                vals.push(Value::Int64(biased.wrapping_sub(INT64_BIAS) as i64));
                pos += 8;
            }
            ValueType::Bytes => {
                let terminator = data[pos..]
                    .iter()
                    .position(|&b| b == 0x00)
                    .ok_or_else(|| eyre::eyre!("truncated tuple: unterminated bytes column"))?;
                vals.push(Value::Bytes(unescape(&data[pos..pos + terminator])?));
                pos += terminator + 1;
            }
        }
    }
    ensure!(
        pos == data.len(),
        "trailing bytes after tuple: {} of {} consumed",
        pos,
        data.len()
    );
    Ok(vals)
}

fn escape_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b <= 0x01 {
            out.push(0x01);
            out.push(b + 1);
        } else {
            out.push(b);
        }
    }
}

fn unescape(escaped: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut iter = escaped.iter();
    while let Some(&b) = iter.next() {
        if b == 0x01 {
            let &next = iter
                .next()
                .ok_or_else(|| eyre::eyre!("dangling escape byte in tuple"))?;
            ensure!(
                next == 0x01 || next == 0x02,
                "bad escape sequence 0x01 {:#04x}",
                next
            );
            out.push(next - 1);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}
