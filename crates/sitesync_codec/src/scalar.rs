//! Tagged scalar values carried in row changes.

use crate::error::{CodecError, CodecResult};
use crate::reader::WireReader;
use crate::writer::WireWriter;
use serde_json::{json, Value as JsonValue};

/// Largest integer magnitude a JSON float can carry exactly (2^53 - 1).
///
/// Integers beyond this are carried as decimal strings in the JSON
/// variant so they survive peers that parse numbers as doubles.
pub const MAX_SAFE_JSON_INTEGER: i64 = 9_007_199_254_740_991;

/// A column value as carried on the wire.
///
/// Scalars are explicitly type-tagged so that null is a single wire
/// value and 64-bit integers are never squeezed through floats.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 64-bit integer, carried exactly.
    Integer(i64),
    /// IEEE 754 double.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Byte string.
    Blob(Vec<u8>),
}

/// Wire tag for null.
pub const TAG_NULL: u8 = 0;
/// Wire tag for 64-bit integers.
pub const TAG_INT64: u8 = 1;
/// Wire tag for doubles.
pub const TAG_FLOAT64: u8 = 2;
/// Wire tag for text.
pub const TAG_STRING: u8 = 3;
/// Wire tag for booleans.
pub const TAG_BOOL: u8 = 4;
/// Wire tag for byte strings.
pub const TAG_BLOB: u8 = 5;

impl Scalar {
    /// Returns the wire tag for this scalar.
    pub fn tag(&self) -> u8 {
        match self {
            Scalar::Null => TAG_NULL,
            Scalar::Integer(_) => TAG_INT64,
            Scalar::Real(_) => TAG_FLOAT64,
            Scalar::Text(_) => TAG_STRING,
            Scalar::Bool(_) => TAG_BOOL,
            Scalar::Blob(_) => TAG_BLOB,
        }
    }

    /// Encode this scalar into a wire writer (tag byte, then payload).
    pub fn encode_to(&self, writer: &mut WireWriter) {
        writer.put_u8(self.tag());
        match self {
            Scalar::Null => {}
            Scalar::Bool(b) => writer.put_bool(*b),
            Scalar::Integer(n) => writer.put_i64(*n),
            Scalar::Real(f) => writer.put_f64(*f),
            Scalar::Text(s) => writer.put_str(s),
            Scalar::Blob(b) => writer.put_bytes(b),
        }
    }

    /// Decode a scalar from a wire reader.
    pub fn decode_from(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let tag = reader.get_u8()?;
        match tag {
            TAG_NULL => Ok(Scalar::Null),
            TAG_INT64 => reader.get_i64().map(Scalar::Integer),
            TAG_FLOAT64 => reader.get_f64().map(Scalar::Real),
            TAG_STRING => reader.get_str().map(Scalar::Text),
            TAG_BOOL => reader.get_bool().map(Scalar::Bool),
            TAG_BLOB => reader.get_bytes().map(Scalar::Blob),
            other => Err(CodecError::UnknownTag {
                what: "scalar",
                tag: other,
            }),
        }
    }

    /// Convert to the tagged JSON representation.
    ///
    /// Integers outside the safe double range become decimal strings;
    /// blobs become lowercase hex strings; non-finite doubles become
    /// their textual names. All other values map to native JSON.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Scalar::Null => json!({ "t": TAG_NULL }),
            Scalar::Bool(b) => json!({ "t": TAG_BOOL, "v": b }),
            Scalar::Integer(n) => {
                if n.unsigned_abs() <= MAX_SAFE_JSON_INTEGER as u64 {
                    json!({ "t": TAG_INT64, "v": n })
                } else {
                    json!({ "t": TAG_INT64, "v": n.to_string() })
                }
            }
            Scalar::Real(f) => {
                if f.is_finite() {
                    json!({ "t": TAG_FLOAT64, "v": f })
                } else {
                    json!({ "t": TAG_FLOAT64, "v": f.to_string() })
                }
            }
            Scalar::Text(s) => json!({ "t": TAG_STRING, "v": s }),
            Scalar::Blob(b) => json!({ "t": TAG_BLOB, "v": to_hex(b) }),
        }
    }

    /// Parse the tagged JSON representation.
    pub fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::invalid_json("scalar must be an object"))?;
        let tag = obj
            .get("t")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| CodecError::invalid_json("scalar missing tag"))?;
        let v = obj.get("v");

        match u8::try_from(tag) {
            Ok(TAG_NULL) => Ok(Scalar::Null),
            Ok(TAG_BOOL) => v
                .and_then(JsonValue::as_bool)
                .map(Scalar::Bool)
                .ok_or_else(|| CodecError::invalid_json("bool scalar missing value")),
            Ok(TAG_INT64) => match v {
                Some(JsonValue::Number(n)) => n
                    .as_i64()
                    .map(Scalar::Integer)
                    .ok_or_else(|| CodecError::invalid_json("integer out of i64 range")),
                Some(JsonValue::String(s)) => s
                    .parse::<i64>()
                    .map(Scalar::Integer)
                    .map_err(|_| CodecError::invalid_json("malformed integer string")),
                _ => Err(CodecError::invalid_json("integer scalar missing value")),
            },
            Ok(TAG_FLOAT64) => match v {
                Some(JsonValue::Number(n)) => n
                    .as_f64()
                    .map(Scalar::Real)
                    .ok_or_else(|| CodecError::invalid_json("malformed float")),
                Some(JsonValue::String(s)) => s
                    .parse::<f64>()
                    .map(Scalar::Real)
                    .map_err(|_| CodecError::invalid_json("malformed float string")),
                _ => Err(CodecError::invalid_json("float scalar missing value")),
            },
            Ok(TAG_STRING) => v
                .and_then(JsonValue::as_str)
                .map(|s| Scalar::Text(s.to_string()))
                .ok_or_else(|| CodecError::invalid_json("text scalar missing value")),
            Ok(TAG_BLOB) => v
                .and_then(JsonValue::as_str)
                .ok_or_else(|| CodecError::invalid_json("blob scalar missing value"))
                .and_then(from_hex)
                .map(Scalar::Blob),
            _ => Err(CodecError::UnknownTag {
                what: "scalar",
                tag: tag as u8,
            }),
        }
    }
}

/// Encode bytes as a lowercase hex string.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
        out.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
    }
    out
}

/// Decode a hex string into bytes.
pub fn from_hex(text: &str) -> CodecResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(CodecError::invalid_json("hex string has odd length"));
    }
    let mut out = Vec::with_capacity(text.len() / 2);
    let bytes = text.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char)
            .to_digit(16)
            .ok_or_else(|| CodecError::invalid_json("invalid hex digit"))?;
        let lo = (pair[1] as char)
            .to_digit(16)
            .ok_or_else(|| CodecError::invalid_json("invalid hex digit"))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}
