//! Row-level change records.

use crate::seq::Seq;
use crate::site::SiteId;
use sitesync_codec::{CodecError, CodecResult, Scalar, WireReader, WireWriter};
use serde_json::{json, Value as JsonValue};

/// A single cell change, as produced by the local store.
///
/// Immutable once produced; the sync layer only transmits and applies
/// these. `db_version` is the producing site's local clock,
/// `col_version` the cell's column lamport, and `origin_site` the site
/// that authored the write (`None` means the local site).
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Table the changed row lives in.
    pub table: String,
    /// Packed primary key of the row.
    pub pk: Vec<u8>,
    /// Changed column name.
    pub column: String,
    /// New cell value.
    pub value: Scalar,
    /// Column lamport version.
    pub col_version: u64,
    /// Site-local database version of the producing commit.
    pub db_version: u64,
    /// Site that authored this write, if not local.
    pub origin_site: Option<SiteId>,
    /// Row liveness counter, opaque to the sync layer.
    pub causal_length: u64,
}

impl Change {
    /// Encodes into a wire writer, fields in declared order.
    pub fn encode_to(&self, writer: &mut WireWriter) {
        writer.put_str(&self.table);
        writer.put_bytes(&self.pk);
        writer.put_str(&self.column);
        self.value.encode_to(writer);
        writer.put_u64(self.col_version);
        writer.put_u64(self.db_version);
        match self.origin_site {
            Some(site) => {
                writer.put_u8(1);
                site.encode_to(writer);
            }
            None => writer.put_u8(0),
        }
        writer.put_u64(self.causal_length);
    }

    /// Decodes from a wire reader.
    pub fn decode_from(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let table = reader.get_str()?;
        let pk = reader.get_bytes()?;
        let column = reader.get_str()?;
        let value = Scalar::decode_from(reader)?;
        let col_version = reader.get_u64()?;
        let db_version = reader.get_u64()?;
        let origin_site = match reader.get_u8()? {
            0 => None,
            1 => Some(SiteId::decode_from(reader)?),
            other => {
                return Err(CodecError::invalid_structure(format!(
                    "invalid origin-site presence byte: {other}"
                )))
            }
        };
        let causal_length = reader.get_u64()?;
        Ok(Self {
            table,
            pk,
            column,
            value,
            col_version,
            db_version,
            origin_site,
            causal_length,
        })
    }

    /// Converts to the JSON debug representation.
    pub fn to_json(&self) -> JsonValue {
        json!({
            "table": self.table,
            "pk": sitesync_codec::to_hex(&self.pk),
            "column": self.column,
            "value": self.value.to_json(),
            "col_version": json_u64(self.col_version),
            "db_version": json_u64(self.db_version),
            "origin_site": self.origin_site.map(|s| s.to_hex()),
            "causal_length": json_u64(self.causal_length),
        })
    }

    /// Parses the JSON debug representation.
    pub fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::invalid_json("change must be an object"))?;

        let table = obj
            .get("table")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| CodecError::invalid_json("change missing table"))?
            .to_string();
        let pk = obj
            .get("pk")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| CodecError::invalid_json("change missing pk"))
            .and_then(sitesync_codec::from_hex)?;
        let column = obj
            .get("column")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| CodecError::invalid_json("change missing column"))?
            .to_string();
        let value = Scalar::from_json(
            obj.get("value")
                .ok_or_else(|| CodecError::invalid_json("change missing value"))?,
        )?;
        let col_version = parse_u64(obj.get("col_version"), "col_version")?;
        let db_version = parse_u64(obj.get("db_version"), "db_version")?;
        let origin_site = match obj.get("origin_site") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(
                SiteId::from_hex(s)
                    .ok_or_else(|| CodecError::invalid_json("malformed origin_site"))?,
            ),
            Some(_) => return Err(CodecError::invalid_json("malformed origin_site")),
        };
        let causal_length = parse_u64(obj.get("causal_length"), "causal_length")?;

        Ok(Self {
            table,
            pk,
            column,
            value,
            col_version,
            db_version,
            origin_site,
            causal_length,
        })
    }
}

/// Encodes a u64 as a JSON number, or a decimal string above 2^53 − 1.
pub(crate) fn json_u64(value: u64) -> JsonValue {
    if value <= sitesync_codec::MAX_SAFE_JSON_INTEGER as u64 {
        json!(value)
    } else {
        json!(value.to_string())
    }
}

/// Parses a u64 written by [`json_u64`].
pub(crate) fn parse_u64(value: Option<&JsonValue>, field: &str) -> CodecResult<u64> {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .ok_or_else(|| CodecError::invalid_json(format!("{field} out of u64 range"))),
        Some(JsonValue::String(s)) => s
            .parse::<u64>()
            .map_err(|_| CodecError::invalid_json(format!("malformed {field}"))),
        _ => Err(CodecError::invalid_json(format!("missing {field}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Change {
        Change {
            table: "todos".to_string(),
            pk: vec![0x01, 0x02],
            column: "title".to_string(),
            value: Scalar::Text("buy milk".to_string()),
            col_version: 3,
            db_version: 17,
            origin_site: Some(SiteId::from_bytes([7u8; 16])),
            causal_length: 1,
        }
    }

    #[test]
    fn wire_roundtrip() {
        for change in [
            sample(),
            Change {
                origin_site: None,
                value: Scalar::Null,
                ..sample()
            },
        ] {
            let mut w = WireWriter::new();
            change.encode_to(&mut w);
            let bytes = w.into_bytes();
            let mut r = WireReader::new(&bytes);
            assert_eq!(Change::decode_from(&mut r).unwrap(), change);
            r.finish().unwrap();
        }
    }

    #[test]
    fn json_roundtrip() {
        let change = Change {
            db_version: u64::MAX,
            ..sample()
        };
        let json = change.to_json();
        assert_eq!(Change::from_json(&json).unwrap(), change);
    }

    #[test]
    fn invalid_presence_byte() {
        let mut w = WireWriter::new();
        let change = sample();
        change.encode_to(&mut w);
        let mut bytes = w.into_bytes();
        // Corrupt the origin-site presence byte.
        let flag_at = bytes.len() - 8 - 16 - 1;
        bytes[flag_at] = 9;
        let mut r = WireReader::new(&bytes);
        assert!(Change::decode_from(&mut r).is_err());
    }
}
