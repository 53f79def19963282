//! Logical clock positions in a site's change log.

use serde::{Deserialize, Serialize};
use sitesync_codec::{CodecResult, WireReader, WireWriter};
use std::fmt;

/// A position in a site's local change log.
///
/// Ordered by `(version, counter)`. A `Seq` means "up through this
/// point"; watermarks compare with [`Seq::cmp`] and advance only after
/// durable application.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Seq {
    /// Database version component.
    pub version: u64,
    /// Intra-version counter component.
    pub counter: u32,
}

impl Seq {
    /// The origin position, before any change.
    pub const ZERO: Seq = Seq {
        version: 0,
        counter: 0,
    };

    /// Creates a new sequence position.
    pub fn new(version: u64, counter: u32) -> Self {
        Self { version, counter }
    }

    /// Encodes as fixed-width big-endian version + counter.
    pub fn encode_to(&self, writer: &mut WireWriter) {
        writer.put_u64(self.version);
        writer.put_u32(self.counter);
    }

    /// Decodes from a wire reader.
    pub fn decode_from(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        let version = reader.get_u64()?;
        let counter = reader.get_u32()?;
        Ok(Self { version, counter })
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.counter)
    }
}
