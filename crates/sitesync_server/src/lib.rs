//! # sitesync Server
//!
//! Connection broker and shared database cache for sitesync servers.
//!
//! This crate provides:
//! - `DbCache`: reference-counted registry of open store handles, so N
//!   clients syncing one logical database share one handle
//! - `SyncConnection`: the server half of a sync session
//! - `ConnectionBroker`: authentication and connection lifecycle
//! - HMAC-SHA256 access tokens
//!
//! The broker is transport-agnostic: the host's accept loop owns the
//! physical sockets, decodes each connection's announce, and hands it
//! to [`ConnectionBroker::open_connection`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod broker;
mod config;
mod connection;
mod db_cache;
mod error;

pub use auth::TokenValidator;
pub use broker::ConnectionBroker;
pub use config::ServerConfig;
pub use connection::SyncConnection;
pub use db_cache::{DbCache, StoreOpener};
pub use error::{ServerError, ServerResult};
