//! Protocol messages for sync.

use crate::change::{json_u64, parse_u64, Change};
use crate::seq::Seq;
use crate::site::SiteId;
use serde_json::{json, Value as JsonValue};
use sitesync_codec::{CodecError, CodecResult, WireReader, WireWriter};

/// Wire tag for [`AnnouncePresence`].
pub const TAG_ANNOUNCE_PRESENCE: u8 = 1;
/// Wire tag for [`Changes`].
pub const TAG_CHANGES: u8 = 2;
/// Wire tag for [`RejectChanges`].
pub const TAG_REJECT_CHANGES: u8 = 3;
/// Wire tag for [`StartStreaming`].
pub const TAG_START_STREAMING: u8 = 4;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A peer announcing itself and its watermarks.
    AnnouncePresence(AnnouncePresence),
    /// A changeset batch.
    Changes(Changes),
    /// Rejection of an out-of-order changeset.
    RejectChanges(RejectChanges),
    /// Instruction telling the peer where to stream from.
    StartStreaming(StartStreaming),
}

impl Message {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            Message::AnnouncePresence(_) => TAG_ANNOUNCE_PRESENCE,
            Message::Changes(_) => TAG_CHANGES,
            Message::RejectChanges(_) => TAG_REJECT_CHANGES,
            Message::StartStreaming(_) => TAG_START_STREAMING,
        }
    }

    /// Encodes to wire bytes: tag byte, then fields in declared order.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.put_u8(self.type_code());
        match self {
            Message::AnnouncePresence(msg) => msg.encode_fields(&mut writer),
            Message::Changes(msg) => msg.encode_fields(&mut writer),
            Message::RejectChanges(msg) => msg.encode_fields(&mut writer),
            Message::StartStreaming(msg) => msg.encode_fields(&mut writer),
        }
        writer.into_bytes()
    }

    /// Decodes from wire bytes, rejecting trailing bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = WireReader::new(bytes);
        let tag = reader.get_u8()?;
        let message = match tag {
            TAG_ANNOUNCE_PRESENCE => {
                Message::AnnouncePresence(AnnouncePresence::decode_fields(&mut reader)?)
            }
            TAG_CHANGES => Message::Changes(Changes::decode_fields(&mut reader)?),
            TAG_REJECT_CHANGES => Message::RejectChanges(RejectChanges::decode_fields(&mut reader)?),
            TAG_START_STREAMING => {
                Message::StartStreaming(StartStreaming::decode_fields(&mut reader)?)
            }
            other => {
                return Err(CodecError::UnknownTag {
                    what: "message",
                    tag: other,
                })
            }
        };
        reader.finish()?;
        Ok(message)
    }

    /// Encodes to the JSON debug representation.
    pub fn encode_json(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    /// Decodes from the JSON debug representation.
    pub fn decode_json(bytes: &[u8]) -> CodecResult<Self> {
        let value: JsonValue = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::invalid_json(e.to_string()))?;
        Self::from_json(&value)
    }

    /// Converts to a JSON value.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Message::AnnouncePresence(msg) => msg.to_json(),
            Message::Changes(msg) => msg.to_json(),
            Message::RejectChanges(msg) => msg.to_json(),
            Message::StartStreaming(msg) => msg.to_json(),
        }
    }

    /// Parses a JSON value.
    pub fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let tag = value
            .get("t")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| CodecError::invalid_json("message missing tag"))?;
        match u8::try_from(tag) {
            Ok(TAG_ANNOUNCE_PRESENCE) => {
                AnnouncePresence::from_json(value).map(Message::AnnouncePresence)
            }
            Ok(TAG_CHANGES) => Changes::from_json(value).map(Message::Changes),
            Ok(TAG_REJECT_CHANGES) => RejectChanges::from_json(value).map(Message::RejectChanges),
            Ok(TAG_START_STREAMING) => {
                StartStreaming::from_json(value).map(Message::StartStreaming)
            }
            _ => Err(CodecError::UnknownTag {
                what: "message",
                tag: tag.min(u64::from(u8::MAX)) as u8,
            }),
        }
    }
}

/// A peer announcing its identity, watermarks, and schema.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncePresence {
    /// The announcing site.
    pub sender: SiteId,
    /// The announcing site's last-seen watermark per known peer.
    pub last_seens: Vec<(SiteId, Seq)>,
    /// Schema name the site's database was created with.
    pub schema_name: String,
    /// Schema version the site's database was created with.
    pub schema_version: String,
}

impl AnnouncePresence {
    /// Looks up the announced watermark for a given site.
    pub fn last_seen_of(&self, site: SiteId) -> Seq {
        self.last_seens
            .iter()
            .find(|(s, _)| *s == site)
            .map(|(_, seq)| *seq)
            .unwrap_or(Seq::ZERO)
    }

    fn encode_fields(&self, writer: &mut WireWriter) {
        self.sender.encode_to(writer);
        writer.put_varint(self.last_seens.len() as u64);
        for (site, seq) in &self.last_seens {
            site.encode_to(writer);
            seq.encode_to(writer);
        }
        writer.put_str(&self.schema_name);
        writer.put_str(&self.schema_version);
    }

    fn decode_fields(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let sender = SiteId::decode_from(reader)?;
        let count = reader.get_count()?;
        let mut last_seens = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let site = SiteId::decode_from(reader)?;
            let seq = Seq::decode_from(reader)?;
            last_seens.push((site, seq));
        }
        let schema_name = reader.get_str()?;
        let schema_version = reader.get_str()?;
        Ok(Self {
            sender,
            last_seens,
            schema_name,
            schema_version,
        })
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "t": TAG_ANNOUNCE_PRESENCE,
            "sender": self.sender.to_hex(),
            "last_seens": self.last_seens.iter().map(|(site, seq)| {
                json!({
                    "site": site.to_hex(),
                    "version": json_u64(seq.version),
                    "counter": seq.counter,
                })
            }).collect::<Vec<_>>(),
            "schema_name": self.schema_name,
            "schema_version": self.schema_version,
        })
    }

    fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let sender = parse_site(value.get("sender"), "sender")?;
        let entries = value
            .get("last_seens")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| CodecError::invalid_json("missing last_seens"))?;
        let mut last_seens = Vec::with_capacity(entries.len());
        for entry in entries {
            let site = parse_site(entry.get("site"), "site")?;
            let seq = parse_seq(entry)?;
            last_seens.push((site, seq));
        }
        let schema_name = parse_str(value.get("schema_name"), "schema_name")?;
        let schema_version = parse_str(value.get("schema_version"), "schema_version")?;
        Ok(Self {
            sender,
            last_seens,
            schema_name,
            schema_version,
        })
    }
}

/// An ordered changeset batch from one sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes {
    /// The sending site.
    pub sender: SiteId,
    /// Watermark this batch continues from.
    pub since: Seq,
    /// The changes, in the sender's log order.
    pub changes: Vec<Change>,
}

impl Changes {
    fn encode_fields(&self, writer: &mut WireWriter) {
        self.sender.encode_to(writer);
        self.since.encode_to(writer);
        writer.put_varint(self.changes.len() as u64);
        for change in &self.changes {
            change.encode_to(writer);
        }
    }

    fn decode_fields(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let sender = SiteId::decode_from(reader)?;
        let since = Seq::decode_from(reader)?;
        let count = reader.get_count()?;
        let mut changes = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            changes.push(Change::decode_from(reader)?);
        }
        Ok(Self {
            sender,
            since,
            changes,
        })
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "t": TAG_CHANGES,
            "sender": self.sender.to_hex(),
            "version": json_u64(self.since.version),
            "counter": self.since.counter,
            "changes": self.changes.iter().map(Change::to_json).collect::<Vec<_>>(),
        })
    }

    fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let sender = parse_site(value.get("sender"), "sender")?;
        let since = parse_seq(value)?;
        let entries = value
            .get("changes")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| CodecError::invalid_json("missing changes"))?;
        let changes = entries
            .iter()
            .map(Change::from_json)
            .collect::<CodecResult<Vec<_>>>()?;
        Ok(Self {
            sender,
            since,
            changes,
        })
    }
}

/// Rejection of a changeset that skipped ahead of the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectChanges {
    /// Whose stream is being rejected.
    pub whose: SiteId,
    /// The receiver's true watermark; the sender rewinds to this.
    pub since: Seq,
}

impl RejectChanges {
    fn encode_fields(&self, writer: &mut WireWriter) {
        self.whose.encode_to(writer);
        self.since.encode_to(writer);
    }

    fn decode_fields(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let whose = SiteId::decode_from(reader)?;
        let since = Seq::decode_from(reader)?;
        Ok(Self { whose, since })
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "t": TAG_REJECT_CHANGES,
            "whose": self.whose.to_hex(),
            "version": json_u64(self.since.version),
            "counter": self.since.counter,
        })
    }

    fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let whose = parse_site(value.get("whose"), "whose")?;
        let since = parse_seq(value)?;
        Ok(Self { whose, since })
    }
}

/// Instruction telling the peer where to begin streaming from.
#[derive(Debug, Clone, PartialEq)]
pub struct StartStreaming {
    /// Watermark the peer should resume from.
    pub since: Seq,
    /// Sites whose changes must not be echoed back.
    pub exclude_sites: Vec<SiteId>,
    /// Restrict the stream to the peer's own writes.
    pub local_only: bool,
}

impl StartStreaming {
    fn encode_fields(&self, writer: &mut WireWriter) {
        self.since.encode_to(writer);
        writer.put_varint(self.exclude_sites.len() as u64);
        for site in &self.exclude_sites {
            site.encode_to(writer);
        }
        writer.put_bool(self.local_only);
    }

    fn decode_fields(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let since = Seq::decode_from(reader)?;
        let count = reader.get_count()?;
        let mut exclude_sites = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            exclude_sites.push(SiteId::decode_from(reader)?);
        }
        let local_only = reader.get_bool()?;
        Ok(Self {
            since,
            exclude_sites,
            local_only,
        })
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "t": TAG_START_STREAMING,
            "version": json_u64(self.since.version),
            "counter": self.since.counter,
            "exclude_sites": self.exclude_sites.iter().map(SiteId::to_hex).collect::<Vec<_>>(),
            "local_only": self.local_only,
        })
    }

    fn from_json(value: &JsonValue) -> CodecResult<Self> {
        let since = parse_seq(value)?;
        let entries = value
            .get("exclude_sites")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| CodecError::invalid_json("missing exclude_sites"))?;
        let exclude_sites = entries
            .iter()
            .map(|e| parse_site(Some(e), "exclude site"))
            .collect::<CodecResult<Vec<_>>>()?;
        let local_only = value
            .get("local_only")
            .and_then(JsonValue::as_bool)
            .ok_or_else(|| CodecError::invalid_json("missing local_only"))?;
        Ok(Self {
            since,
            exclude_sites,
            local_only,
        })
    }
}

fn parse_site(value: Option<&JsonValue>, field: &str) -> CodecResult<SiteId> {
    value
        .and_then(JsonValue::as_str)
        .and_then(SiteId::from_hex)
        .ok_or_else(|| CodecError::invalid_json(format!("malformed {field}")))
}

fn parse_str(value: Option<&JsonValue>, field: &str) -> CodecResult<String> {
    value
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| CodecError::invalid_json(format!("missing {field}")))
}

fn parse_seq(value: &JsonValue) -> CodecResult<Seq> {
    let version = parse_u64(value.get("version"), "version")?;
    let counter = value
        .get("counter")
        .and_then(JsonValue::as_u64)
        .and_then(|c| u32::try_from(c).ok())
        .ok_or_else(|| CodecError::invalid_json("malformed counter"))?;
    Ok(Seq { version, counter })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_codec::Scalar;

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    fn change(db_version: u64, value: Scalar) -> Change {
        Change {
            table: "todos".to_string(),
            pk: vec![1, 2, 3],
            column: "done".to_string(),
            value,
            col_version: 1,
            db_version,
            origin_site: Some(site(0x0a)),
            causal_length: 1,
        }
    }

    fn roundtrip(message: Message) {
        let bytes = message.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), message);
        let json = message.encode_json();
        assert_eq!(Message::decode_json(&json).unwrap(), message);
    }

    #[test]
    fn announce_presence_roundtrip() {
        roundtrip(Message::AnnouncePresence(AnnouncePresence {
            sender: site(1),
            last_seens: vec![(site(2), Seq::new(5, 0)), (site(3), Seq::new(9, 2))],
            schema_name: "todo-app".to_string(),
            schema_version: "1".to_string(),
        }));
    }

    #[test]
    fn announce_presence_empty_watermarks() {
        roundtrip(Message::AnnouncePresence(AnnouncePresence {
            sender: site(1),
            last_seens: vec![],
            schema_name: String::new(),
            schema_version: "2024-05".to_string(),
        }));
    }

    #[test]
    fn changes_roundtrip() {
        roundtrip(Message::Changes(Changes {
            sender: site(1),
            since: Seq::new(4, 1),
            changes: vec![
                change(5, Scalar::Null),
                change(5, Scalar::Integer(0)),
                change(6, Scalar::Blob(vec![])),
                change(6, Scalar::Blob(vec![0x42; 16])),
            ],
        }));
    }

    #[test]
    fn changes_empty_batch() {
        roundtrip(Message::Changes(Changes {
            sender: site(1),
            since: Seq::ZERO,
            changes: vec![],
        }));
    }

    #[test]
    fn changes_carries_wide_integers_exactly() {
        // 2^53 - 1, 2^53, and 2^63 - 1 must survive both codecs.
        for n in [
            9_007_199_254_740_991_i64,
            9_007_199_254_740_992_i64,
            i64::MAX,
        ] {
            roundtrip(Message::Changes(Changes {
                sender: site(1),
                since: Seq::new(n as u64, 0),
                changes: vec![change(n as u64, Scalar::Integer(n))],
            }));
        }
    }

    #[test]
    fn reject_changes_roundtrip() {
        roundtrip(Message::RejectChanges(RejectChanges {
            whose: site(7),
            since: Seq::new(5, 0),
        }));
    }

    #[test]
    fn start_streaming_roundtrip() {
        roundtrip(Message::StartStreaming(StartStreaming {
            since: Seq::new(12, 0),
            exclude_sites: vec![site(1), site(2)],
            local_only: true,
        }));
        roundtrip(Message::StartStreaming(StartStreaming {
            since: Seq::ZERO,
            exclude_sites: vec![],
            local_only: false,
        }));
    }

    #[test]
    fn message_type_codes() {
        let announce = Message::AnnouncePresence(AnnouncePresence {
            sender: site(0),
            last_seens: vec![],
            schema_name: String::new(),
            schema_version: String::new(),
        });
        assert_eq!(announce.type_code(), 1);
        assert_eq!(
            Message::Changes(Changes {
                sender: site(0),
                since: Seq::ZERO,
                changes: vec![],
            })
            .type_code(),
            2
        );
        assert_eq!(
            Message::RejectChanges(RejectChanges {
                whose: site(0),
                since: Seq::ZERO,
            })
            .type_code(),
            3
        );
        assert_eq!(
            Message::StartStreaming(StartStreaming {
                since: Seq::ZERO,
                exclude_sites: vec![],
                local_only: false,
            })
            .type_code(),
            4
        );
    }

    #[test]
    fn unknown_message_tag_rejected() {
        assert!(matches!(
            Message::decode(&[0xee]),
            Err(CodecError::UnknownTag {
                what: "message",
                ..
            })
        ));
    }

    #[test]
    fn truncated_message_rejected() {
        let bytes = Message::RejectChanges(RejectChanges {
            whose: site(7),
            since: Seq::new(5, 0),
        })
        .encode();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = Message::RejectChanges(RejectChanges {
            whose: site(7),
            since: Seq::new(5, 0),
        })
        .encode();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn last_seen_lookup() {
        let announce = AnnouncePresence {
            sender: site(1),
            last_seens: vec![(site(2), Seq::new(5, 0))],
            schema_name: "s".to_string(),
            schema_version: "1".to_string(),
        };
        assert_eq!(announce.last_seen_of(site(2)), Seq::new(5, 0));
        assert_eq!(announce.last_seen_of(site(9)), Seq::ZERO);
    }
}
