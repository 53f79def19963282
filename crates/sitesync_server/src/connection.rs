//! Server-side sync connection.

use crate::db_cache::DbCache;
use crate::error::{ServerError, ServerResult};
use parking_lot::Mutex;
use sitesync_engine::{
    BackoffConfig, ChangeStore, InboundStream, OutboundStream, Transport, TransportHandler,
};
use sitesync_protocol::{
    AnnouncePresence, Changes, RejectChanges, Seq, SiteId, StartStreaming,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// One client's session on the server.
///
/// Built when the client announces presence: the logical database is
/// resolved through the shared [`DbCache`], the server's outbound
/// stream is seeded from the watermark the client reported for the
/// server's site, the inbound stream from the server's stored
/// watermark for the client's site, and the client is told where to
/// `StartStreaming` from. Push is symmetric: the server streams its
/// side without being asked. Teardown releases the cache reference
/// exactly once.
pub struct SyncConnection<T: Transport + 'static, S: ChangeStore + 'static> {
    inner: Arc<ConnectionInner<T, S>>,
}

impl<T: Transport + 'static, S: ChangeStore + 'static> Clone for SyncConnection<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ConnectionInner<T: Transport + 'static, S: ChangeStore + 'static> {
    db_name: String,
    client_site: SiteId,
    server_site: SiteId,
    transport: Arc<T>,
    store: Arc<S>,
    cache: Arc<DbCache<S>>,
    outbound: Arc<OutboundStream<T, S>>,
    inbound: InboundStream<T, S>,
    closed: Mutex<bool>,
}

impl<T: Transport + 'static, S: ChangeStore + 'static> SyncConnection<T, S> {
    /// Establishes a connection from a client's announce.
    ///
    /// The cache reference taken here is released by
    /// [`SyncConnection::close`]; on any establishment error it is
    /// released before returning.
    pub fn establish(
        db_name: &str,
        cache: Arc<DbCache<S>>,
        transport: Arc<T>,
        announce: &AnnouncePresence,
        backoff: BackoffConfig,
    ) -> ServerResult<Self> {
        let store = cache.get_and_ref(db_name, &announce.schema_name, &announce.schema_version)?;

        match Self::wire_up(db_name, &cache, store, transport, announce, backoff) {
            Ok(connection) => Ok(connection),
            Err(err) => {
                if let Err(unref_err) = cache.unref(db_name) {
                    error!(error = %unref_err, "unref after failed establish");
                }
                Err(err)
            }
        }
    }

    fn wire_up(
        db_name: &str,
        cache: &Arc<DbCache<S>>,
        store: Arc<S>,
        transport: Arc<T>,
        announce: &AnnouncePresence,
        backoff: BackoffConfig,
    ) -> ServerResult<Self> {
        let server_site = store.site_id();
        let client_site = announce.sender;
        if client_site == server_site {
            return Err(ServerError::InvalidRequest(
                "peer announced this server's own site id".into(),
            ));
        }

        let outbound = OutboundStream::new(Arc::clone(&transport), Arc::clone(&store), backoff);
        let inbound = InboundStream::new(Arc::clone(&transport), Arc::clone(&store));
        inbound.prepare(&store.get_last_seens().map_err(ServerError::Sync)?);

        let inner = Arc::new(ConnectionInner {
            db_name: db_name.to_string(),
            client_site,
            server_site,
            transport,
            store,
            cache: Arc::clone(cache),
            outbound,
            inbound,
            closed: Mutex::new(false),
        });

        inner
            .transport
            .set_handler(Arc::clone(&inner) as Arc<dyn TransportHandler>);
        inner.transport.start().map_err(ServerError::Sync)?;

        // Tell the client where to resume from, excluding our own
        // changes from the echo path.
        let client_since = inner
            .store
            .get_last_seen(client_site)
            .map_err(ServerError::Sync)?;
        inner
            .transport
            .start_streaming(&StartStreaming {
                since: client_since,
                exclude_sites: vec![server_site],
                local_only: false,
            })
            .map_err(ServerError::Sync)?;
        debug!(
            db = %inner.db_name,
            client = %client_site,
            since = %client_since,
            "connection established"
        );

        // Push our side from the watermark the client reported for us.
        inner
            .outbound
            .start(announce.last_seen_of(server_site), vec![client_site], false);

        Ok(Self { inner })
    }

    /// Logical database this connection is bound to.
    pub fn db_name(&self) -> &str {
        &self.inner.db_name
    }

    /// The connected client's site.
    pub fn client_site(&self) -> SiteId {
        self.inner.client_site
    }

    /// The shared store handle's site.
    pub fn server_site(&self) -> SiteId {
        self.inner.server_site
    }

    /// The shared store handle.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// The last position confirmed sent to the client.
    pub fn last_sent(&self) -> Seq {
        self.inner.outbound.last_sent()
    }

    /// Delay until the next scheduled outbound retry.
    pub fn pending_retry(&self) -> Option<Duration> {
        self.inner.outbound.pending_retry()
    }

    /// Invoked by the host when the retry delay elapses.
    pub fn on_retry_timer(&self) {
        self.inner.outbound.on_retry_timer();
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// Stops both streams, closes the transport, and releases the
    /// cache reference. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<T: Transport + 'static, S: ChangeStore + 'static> ConnectionInner<T, S> {
    fn close(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.outbound.stop();
        self.inbound.stop();
        if let Err(err) = self.transport.close() {
            warn!(error = %err, "transport close failed");
        }
        if let Err(err) = self.cache.unref(&self.db_name) {
            error!(error = %err, db = %self.db_name, "cache unref failed");
        }
        debug!(db = %self.db_name, client = %self.client_site, "connection closed");
    }
}

impl<T: Transport + 'static, S: ChangeStore + 'static> TransportHandler for ConnectionInner<T, S> {
    fn on_changes(&self, message: Changes) {
        if let Err(err) = self.inbound.receive_changes(message) {
            warn!(error = %err, "failed to apply inbound changeset");
        }
    }

    fn on_start_streaming(&self, message: StartStreaming) {
        self.outbound
            .start(message.since, message.exclude_sites, message.local_only);
    }

    fn on_reset_stream(&self, message: RejectChanges) {
        if message.whose != self.server_site {
            debug!(whose = %message.whose, "ignoring reset for another site");
            return;
        }
        self.outbound.reset(message.since);
    }

    fn on_announce_presence(&self, message: AnnouncePresence) {
        // One announce establishes a connection; a second one on the
        // same connection is a protocol-state bug.
        error!(
            sender = %message.sender,
            "double establish on one connection"
        );
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_engine::{MemoryChangeStore, MockTransport};
    use sitesync_protocol::{Message, Scalar};

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    fn cache() -> Arc<DbCache<MemoryChangeStore>> {
        // The server's store always runs as site 0xaa in these tests.
        Arc::new(DbCache::new(|_db: &str, schema: &str, version: &str| {
            let store = Arc::new(MemoryChangeStore::with_site_id(site(0xaa)));
            store.migrate_to(schema, version)?;
            Ok(store)
        }))
    }

    fn announce(sender: SiteId, seen_server: Seq) -> AnnouncePresence {
        AnnouncePresence {
            sender,
            last_seens: vec![(site(0xaa), seen_server)],
            schema_name: "s".into(),
            schema_version: "1".into(),
        }
    }

    fn establish(
        cache: &Arc<DbCache<MemoryChangeStore>>,
        transport: &Arc<MockTransport>,
        client: SiteId,
    ) -> SyncConnection<MockTransport, MemoryChangeStore> {
        SyncConnection::establish(
            "dbA",
            Arc::clone(cache),
            Arc::clone(transport),
            &announce(client, Seq::ZERO),
            BackoffConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn handshake_replies_start_streaming_and_pushes() {
        let cache = cache();
        // Server has data before the client connects.
        let store = cache.get_and_ref("dbA", "s", "1").unwrap();
        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![2], "a", Scalar::Integer(2));

        let transport = Arc::new(MockTransport::new());
        let connection = establish(&cache, &transport, site(2));

        let sent = transport.sent();
        // First frame: StartStreaming telling the client to send
        // everything we have not seen, excluding our own site.
        match &sent[0] {
            Message::StartStreaming(msg) => {
                assert_eq!(msg.since, Seq::ZERO);
                assert_eq!(msg.exclude_sites, vec![site(0xaa)]);
                assert!(!msg.local_only);
            }
            other => panic!("expected StartStreaming, got {other:?}"),
        }
        // Then our push from the client's reported watermark.
        match &sent[1] {
            Message::Changes(msg) => {
                assert_eq!(msg.since, Seq::ZERO);
                assert_eq!(msg.changes.len(), 2);
            }
            other => panic!("expected Changes, got {other:?}"),
        }
        assert_eq!(connection.last_sent(), Seq::new(2, 0));
        connection.close();
    }

    #[test]
    fn returning_client_resumes_from_stored_watermark() {
        let cache = cache();
        let store = cache.get_and_ref("dbA", "s", "1").unwrap();
        // We already durably applied the client's log through (7, 0).
        store
            .apply_changeset_and_set_last_seen(&[], site(2), Seq::new(7, 0))
            .unwrap();

        let transport = Arc::new(MockTransport::new());
        let connection = establish(&cache, &transport, site(2));

        match &transport.sent()[0] {
            Message::StartStreaming(msg) => assert_eq!(msg.since, Seq::new(7, 0)),
            other => panic!("expected StartStreaming, got {other:?}"),
        }
        connection.close();
    }

    #[test]
    fn inbound_changes_reach_the_shared_store() {
        let cache = cache();
        let transport = Arc::new(MockTransport::new());
        let connection = establish(&cache, &transport, site(2));

        transport.deliver(Message::Changes(Changes {
            sender: site(2),
            since: Seq::ZERO,
            changes: vec![sitesync_protocol::Change {
                table: "t".into(),
                pk: vec![1],
                column: "a".into(),
                value: Scalar::Integer(7),
                col_version: 1,
                db_version: 3,
                origin_site: Some(site(2)),
                causal_length: 1,
            }],
        }));

        let store = connection.store();
        assert_eq!(store.value_of("t", &[1], "a"), Some(Scalar::Integer(7)));
        assert_eq!(store.get_last_seen(site(2)).unwrap(), Seq::new(3, 0));
        connection.close();
    }

    #[test]
    fn reject_from_client_rewinds_server_stream() {
        let cache = cache();
        let store = cache.get_and_ref("dbA", "s", "1").unwrap();
        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![2], "a", Scalar::Integer(2));

        let transport = Arc::new(MockTransport::new());
        let connection = establish(&cache, &transport, site(2));
        assert_eq!(connection.last_sent(), Seq::new(2, 0));

        transport.deliver(Message::RejectChanges(RejectChanges {
            whose: site(0xaa),
            since: Seq::new(1, 0),
        }));

        let resent = transport.sent_changes();
        assert_eq!(resent.last().unwrap().since, Seq::new(1, 0));
        connection.close();
    }

    #[test]
    fn close_releases_the_cache_reference_once() {
        let cache = cache();
        let transport = Arc::new(MockTransport::new());
        let connection = establish(&cache, &transport, site(2));
        assert_eq!(cache.ref_count("dbA"), 1);

        connection.close();
        connection.close();
        assert!(connection.is_closed());
        assert_eq!(cache.ref_count("dbA"), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn double_announce_tears_the_connection_down() {
        let cache = cache();
        let transport = Arc::new(MockTransport::new());
        let connection = establish(&cache, &transport, site(2));

        transport.deliver(Message::AnnouncePresence(announce(site(2), Seq::ZERO)));
        assert!(connection.is_closed());
        assert_eq!(cache.ref_count("dbA"), 0);
    }

    #[test]
    fn announcing_the_server_site_is_rejected() {
        let cache = cache();
        let transport = Arc::new(MockTransport::new());
        let result = SyncConnection::establish(
            "dbA",
            Arc::clone(&cache),
            transport,
            &announce(site(0xaa), Seq::ZERO),
            BackoffConfig::default(),
        );
        assert!(result.is_err());
        // The failed establish released its reference.
        assert_eq!(cache.ref_count("dbA"), 0);
    }
}
