//! # sitesync Protocol
//!
//! Sync protocol types and wire codecs for sitesync.
//!
//! This crate provides:
//! - `Seq` logical clock positions and `SiteId` replica identities
//! - `Change` row-change records
//! - The closed `Message` sum type
//!   (AnnouncePresence / Changes / RejectChanges / StartStreaming)
//! - Binary and JSON codecs with `decode(encode(m)) == m` for every
//!   variant
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod messages;
mod seq;
mod site;

pub use change::Change;
pub use messages::{
    AnnouncePresence, Changes, Message, RejectChanges, StartStreaming, TAG_ANNOUNCE_PRESENCE,
    TAG_CHANGES, TAG_REJECT_CHANGES, TAG_START_STREAMING,
};
pub use seq::Seq;
pub use site::SiteId;

// Re-exported so engine and server code can name scalar values without
// depending on the codec crate directly.
pub use sitesync_codec::Scalar;
