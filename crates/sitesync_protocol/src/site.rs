//! Replica identity.

use serde::{Deserialize, Serialize};
use sitesync_codec::{to_hex, CodecResult, WireReader, WireWriter};
use std::fmt;

/// A 16-byte value uniquely identifying a replica.
///
/// Assigned once at replica creation and immutable for the replica's
/// lifetime. A cloned or copied replica must mint a fresh id: reusing
/// an identity breaks causal tracking for every peer that knew the
/// original.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId([u8; 16]);

impl SiteId {
    /// Creates a site id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Mints a fresh random site id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encodes as 16 raw bytes.
    pub fn encode_to(&self, writer: &mut WireWriter) {
        writer.put_site_bytes(&self.0);
    }

    /// Decodes from a wire reader.
    pub fn decode_from(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        reader.get_site_bytes().map(Self)
    }

    /// Lowercase hex form, for the JSON variant and logs.
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    /// Parses the lowercase hex form.
    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = sitesync_codec::from_hex(text).ok()?;
        let raw: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(raw))
    }
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({})", self.to_hex())
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
