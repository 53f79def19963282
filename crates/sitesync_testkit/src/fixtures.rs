//! Deterministic in-memory fixtures for end-to-end sync tests.

use parking_lot::{Mutex, RwLock};
use sitesync_engine::{
    ChangeStore, MemoryChangeStore, SendOutcome, SyncConfig, SyncedDb, Transport,
    TransportHandler, WireFormat,
};
use sitesync_protocol::{
    AnnouncePresence, Change, Changes, Message, RejectChanges, SiteId, StartStreaming,
};
use sitesync_server::{ConnectionBroker, DbCache, ServerConfig};
use std::collections::VecDeque;
use std::sync::Arc;

/// One end of an in-memory duplex transport.
///
/// Frames are queued as encoded bytes and pushed through the real
/// codec on delivery, so fixture traffic exercises the same wire path
/// as a socket. Delivery is explicit via [`TransportPair::pump`] to
/// keep tests deterministic and recursion-free.
pub struct PairEndpoint {
    outgoing: Mutex<VecDeque<Vec<u8>>>,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    buffer_full: Mutex<bool>,
    connected: Mutex<bool>,
    format: WireFormat,
}

impl PairEndpoint {
    fn new(format: WireFormat) -> Arc<Self> {
        Arc::new(Self {
            outgoing: Mutex::new(VecDeque::new()),
            handler: RwLock::new(None),
            buffer_full: Mutex::new(false),
            connected: Mutex::new(true),
            format,
        })
    }

    /// Scripts backpressure for subsequent `send_changes` calls.
    pub fn set_buffer_full(&self, full: bool) {
        *self.buffer_full.lock() = full;
    }

    /// Simulates the channel dropping (sends report `Reconnecting`).
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    /// Takes one queued outbound frame, if any.
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        self.outgoing.lock().pop_front()
    }

    /// Number of queued outbound frames.
    pub fn queued(&self) -> usize {
        self.outgoing.lock().len()
    }

    fn enqueue(&self, message: &Message) {
        self.outgoing.lock().push_back(self.format.encode(message));
    }

    fn dispatch(&self, frame: &[u8]) {
        let message = self
            .format
            .decode(frame)
            .expect("fixture frame failed to decode");
        let handler = self.handler.read().clone();
        let Some(handler) = handler else { return };
        match message {
            Message::Changes(msg) => handler.on_changes(msg),
            Message::StartStreaming(msg) => handler.on_start_streaming(msg),
            Message::RejectChanges(msg) => handler.on_reset_stream(msg),
            Message::AnnouncePresence(msg) => handler.on_announce_presence(msg),
        }
    }
}

impl Transport for PairEndpoint {
    fn send_changes(&self, message: &Changes) -> sitesync_engine::SyncResult<SendOutcome> {
        if !*self.connected.lock() {
            return Ok(SendOutcome::Reconnecting);
        }
        if *self.buffer_full.lock() {
            return Ok(SendOutcome::BufferFull);
        }
        self.enqueue(&Message::Changes(message.clone()));
        Ok(SendOutcome::Sent)
    }

    fn announce_presence(&self, message: &AnnouncePresence) -> sitesync_engine::SyncResult<()> {
        self.enqueue(&Message::AnnouncePresence(message.clone()));
        Ok(())
    }

    fn reject_changes(&self, message: &RejectChanges) -> sitesync_engine::SyncResult<()> {
        self.enqueue(&Message::RejectChanges(message.clone()));
        Ok(())
    }

    fn start_streaming(&self, message: &StartStreaming) -> sitesync_engine::SyncResult<()> {
        self.enqueue(&Message::StartStreaming(message.clone()));
        Ok(())
    }

    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn start(&self) -> sitesync_engine::SyncResult<()> {
        Ok(())
    }

    fn close(&self) -> sitesync_engine::SyncResult<()> {
        *self.connected.lock() = false;
        *self.handler.write() = None;
        Ok(())
    }
}

/// A linked pair of in-memory endpoints.
pub struct TransportPair {
    /// Client-side endpoint.
    pub left: Arc<PairEndpoint>,
    /// Server-side endpoint.
    pub right: Arc<PairEndpoint>,
}

impl TransportPair {
    /// Creates a linked pair using the binary wire format.
    pub fn new() -> Self {
        Self::with_format(WireFormat::Binary)
    }

    /// Creates a linked pair using the given wire format.
    pub fn with_format(format: WireFormat) -> Self {
        Self {
            left: PairEndpoint::new(format),
            right: PairEndpoint::new(format),
        }
    }

    /// Delivers one round of queued frames in both directions.
    /// Returns the number of frames delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Some(frame) = self.left.take_frame() {
            self.right.dispatch(&frame);
            delivered += 1;
        }
        while let Some(frame) = self.right.take_frame() {
            self.left.dispatch(&frame);
            delivered += 1;
        }
        delivered
    }

    /// Pumps until no frames remain in either direction.
    pub fn pump_until_idle(&self) {
        // Bounded so a ping-pong bug fails the test instead of hanging.
        for _ in 0..1000 {
            if self.pump() == 0 {
                return;
            }
        }
        panic!("transport pair did not settle after 1000 rounds");
    }
}

impl Default for TransportPair {
    fn default() -> Self {
        Self::new()
    }
}

/// The site-independent projection of a change, for convergence
/// assertions: local db versions legitimately differ per replica.
pub fn projected(changes: &[Change]) -> Vec<(String, Vec<u8>, String, String, u64, Option<SiteId>)> {
    let mut projection: Vec<_> = changes
        .iter()
        .map(|change| {
            (
                change.table.clone(),
                change.pk.clone(),
                change.column.clone(),
                format!("{:?}", change.value),
                change.col_version,
                change.origin_site,
            )
        })
        .collect();
    projection.sort();
    projection.dedup();
    projection
}

/// A client replica synced to a server replica over a transport pair.
pub struct SitePair {
    /// The client's store.
    pub client_store: Arc<MemoryChangeStore>,
    /// The shared server-side store handle.
    pub server_store: Arc<MemoryChangeStore>,
    /// The client session.
    pub client: SyncedDb<PairEndpoint, MemoryChangeStore>,
    /// The server broker owning the connection.
    pub broker: Arc<ConnectionBroker<PairEndpoint, MemoryChangeStore>>,
    /// Id of the server connection for this client.
    pub connection_id: u64,
    /// The transport carrying this session.
    pub transports: TransportPair,
}

impl SitePair {
    /// Connects a fresh client site to a fresh server site and drives
    /// the handshake to completion.
    ///
    /// The server's opener behaves like a durable database: evicting
    /// the handle at zero references and reopening it yields the same
    /// store state.
    pub fn connect(client_site: SiteId, server_site: SiteId) -> Self {
        let durable: Mutex<Option<Arc<MemoryChangeStore>>> = Mutex::new(None);
        let cache = Arc::new(DbCache::new(move |_db: &str, schema: &str, content: &str| {
            let store = Arc::clone(durable.lock().get_or_insert_with(|| {
                Arc::new(MemoryChangeStore::with_site_id(server_site))
            }));
            store.migrate_to(schema, content)?;
            Ok(store)
        }));
        let broker = Arc::new(ConnectionBroker::new(ServerConfig::default(), cache));
        Self::connect_through(client_site, broker)
    }

    /// Connects a fresh client site through an existing broker
    /// (shared server).
    pub fn connect_through(
        client_site: SiteId,
        broker: Arc<ConnectionBroker<PairEndpoint, MemoryChangeStore>>,
    ) -> Self {
        Self::connect_with_store(
            Arc::new(MemoryChangeStore::with_site_id(client_site)),
            broker,
        )
    }

    /// Connects an existing client store through an existing broker;
    /// used for reconnect scenarios that must resume, not restart.
    pub fn connect_with_store(
        client_store: Arc<MemoryChangeStore>,
        broker: Arc<ConnectionBroker<PairEndpoint, MemoryChangeStore>>,
    ) -> Self {
        let transports = TransportPair::new();
        let config = SyncConfig::new("dbA", "s", "1").with_schema_content("1");
        let client = SyncedDb::connect(
            config,
            Arc::clone(&transports.left),
            Arc::clone(&client_store),
        )
        .expect("client connect");

        // Play the host accept loop: take the client's announce and
        // hand it to the broker with the bootstrap parameters.
        let announce_frame = transports.left.take_frame().expect("announce frame");
        let announce = match Message::decode(&announce_frame).expect("announce decodes") {
            Message::AnnouncePresence(announce) => announce,
            other => panic!("expected announce, got {other:?}"),
        };
        let connection_id = broker
            .open_connection("dbA", Arc::clone(&transports.right), announce, None)
            .expect("open connection");
        let server_store = Arc::clone(
            broker
                .connection(connection_id)
                .expect("connection exists")
                .store(),
        );

        let pair = Self {
            client_store,
            server_store,
            client,
            broker,
            connection_id,
            transports,
        };
        pair.transports.pump_until_idle();
        pair
    }

    /// Drives queued traffic until both sides are idle.
    pub fn settle(&self) {
        self.transports.pump_until_idle();
    }

    /// Closes the client session and the server connection.
    pub fn disconnect(&self) {
        self.client.close();
        self.broker.close_connection(self.connection_id);
    }
}
