//! # sitesync Testkit
//!
//! Test utilities for sitesync.
//!
//! This crate provides:
//! - Proptest strategies for protocol values and whole messages
//! - A deterministic in-memory transport pair that pushes frames
//!   through the real wire codec
//! - Site-pair fixtures wiring a client session to a broker-owned
//!   server connection
//!
//! The end-to-end replication scenarios live in this crate's `tests/`
//! directory, driven entirely by these fixtures.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod fixtures;
mod generators;

pub use fixtures::{projected, PairEndpoint, SitePair, TransportPair};
pub use generators::{arb_change, arb_message, arb_scalar, arb_seq, arb_site_id};
