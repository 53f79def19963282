//! # sitesync Engine
//!
//! Stream state machines and sync sessions for sitesync.
//!
//! This crate provides:
//! - The `ChangeStore` trait the sync layer consumes, with an
//!   in-memory implementation
//! - `OutboundStream`/`InboundStream`, the per-direction state
//!   machines
//! - The `Transport` trait with mock and reconnecting-socket
//!   implementations
//! - The client-side `SyncedDb` session
//!
//! ## Architecture
//!
//! Sync is **bidirectional and symmetric**: each side pushes its own
//! changes on an outbound stream while admitting the peer's on an
//! inbound stream. Delivery is ordered, at-least-once, and resumable:
//! per-site `Seq` watermarks are persisted by the store, and an
//! inbound batch that skips ahead is rejected so the sender rewinds
//! rather than leaving a silent gap.
//!
//! ## Key invariants
//!
//! - At most one outbound pull is in flight per stream
//! - `last_sent` only advances on a confirmed send
//! - `last_seen` only advances with a durable, transactional apply
//! - Backpressure pauses a stream; nothing is queued unboundedly
//! - `stop()`/`close()` are idempotent and detach every listener

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_store;
mod config;
mod error;
mod inbound;
mod outbound;
mod session;
mod socket;
mod transport;

pub use change_store::{
    ChangeCallback, ChangeObservers, ChangeStore, Disposer, MemoryChangeStore, MigrateOutcome,
};
pub use config::{BackoffConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use inbound::{acceptable, InboundStream, ReceiveOutcome};
pub use outbound::OutboundStream;
pub use session::SyncedDb;
pub use socket::{
    ReconnectingSocket, SocketDelegate, SocketFactory, SocketLink, SocketObserver, SocketState,
    SocketTransport, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};
pub use transport::{MockTransport, SendOutcome, Transport, TransportHandler, WireFormat};
