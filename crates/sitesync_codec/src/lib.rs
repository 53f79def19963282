//! # sitesync Codec
//!
//! Binary wire primitives and the tagged scalar model for sitesync.
//!
//! This crate provides:
//! - `WireWriter`/`WireReader` for the sitesync wire layout
//! - `Scalar` with lossless binary and JSON representations
//! - Typed codec errors
//!
//! ## Wire layout rules
//!
//! - One byte discriminant for every tagged union
//! - Fixed-width big-endian 64-bit integers for versions and sequences
//!   (never 53-bit floats)
//! - LEB128 varints for array counts and byte lengths
//! - Fixed 16-byte site identifiers
//! - Decoders reject truncated input, trailing bytes, unknown tags,
//!   oversized lengths, and malformed UTF-8
//!
//! This is a pure codec crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod reader;
mod scalar;
mod writer;

pub use error::{CodecError, CodecResult};
pub use reader::{WireReader, MAX_BYTES_LENGTH, MAX_CONTAINER_ELEMENTS};
pub use scalar::{
    from_hex, to_hex, Scalar, MAX_SAFE_JSON_INTEGER, TAG_BLOB, TAG_BOOL, TAG_FLOAT64, TAG_INT64,
    TAG_NULL, TAG_STRING,
};
pub use writer::WireWriter;

/// Trait for types with a sitesync wire encoding.
pub trait WireEncode {
    /// Append this value's encoding to a writer.
    fn encode_to(&self, writer: &mut WireWriter);

    /// Encode this value into a fresh byte vector.
    fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.encode_to(&mut writer);
        writer.into_bytes()
    }
}

/// Trait for types decodable from the sitesync wire encoding.
pub trait WireDecode: Sized {
    /// Decode one value from a reader.
    fn decode_from(reader: &mut WireReader<'_>) -> CodecResult<Self>;

    /// Decode a complete value, rejecting trailing bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = WireReader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

impl WireEncode for Scalar {
    fn encode_to(&self, writer: &mut WireWriter) {
        Scalar::encode_to(self, writer);
    }
}

impl WireDecode for Scalar {
    fn decode_from(reader: &mut WireReader<'_>) -> CodecResult<Self> {
        Scalar::decode_from(reader)
    }
}
