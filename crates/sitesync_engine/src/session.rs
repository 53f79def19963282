//! Client-side sync session.

use crate::change_store::ChangeStore;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::inbound::InboundStream;
use crate::outbound::OutboundStream;
use crate::transport::{Transport, TransportHandler};
use parking_lot::Mutex;
use sitesync_protocol::{AnnouncePresence, Changes, RejectChanges, SiteId, StartStreaming};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A database bound to one remote peer.
///
/// Owns one outbound and one inbound stream over a single transport
/// and drives the handshake: announce presence with stored watermarks,
/// wait for the peer's `StartStreaming`, then push and receive
/// concurrently. On a clean transport reopen the session re-announces
/// and re-seeds the inbound watermarks, resuming rather than
/// restarting the causal state.
pub struct SyncedDb<T: Transport + 'static, S: ChangeStore + 'static> {
    inner: Arc<SessionInner<T, S>>,
}

struct SessionInner<T: Transport, S: ChangeStore> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    outbound: Arc<OutboundStream<T, S>>,
    inbound: InboundStream<T, S>,
    closed: Mutex<bool>,
}

impl<T: Transport + 'static, S: ChangeStore + 'static> SyncedDb<T, S> {
    /// Connects a store to a peer over the given transport.
    ///
    /// Applies the configured schema (if any), opens the transport,
    /// and announces presence. Streaming begins when the peer answers
    /// with `StartStreaming`.
    pub fn connect(config: SyncConfig, transport: Arc<T>, store: Arc<S>) -> SyncResult<Self> {
        if let Some(content) = &config.schema_content {
            let outcome = store.migrate_to(&config.schema_name, content)?;
            debug!(schema = %config.schema_name, ?outcome, "schema applied");
        }

        let outbound = OutboundStream::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            config.backoff.clone(),
        );
        let inbound = InboundStream::new(Arc::clone(&transport), Arc::clone(&store));

        let inner = Arc::new(SessionInner {
            config,
            transport,
            store,
            outbound,
            inbound,
            closed: Mutex::new(false),
        });

        inner
            .transport
            .set_handler(Arc::clone(&inner) as Arc<dyn TransportHandler>);
        inner.transport.start()?;
        inner.announce()?;

        Ok(Self { inner })
    }

    /// This replica's site id.
    pub fn site_id(&self) -> SiteId {
        self.inner.store.site_id()
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// The last position confirmed sent to the peer.
    pub fn last_sent(&self) -> sitesync_protocol::Seq {
        self.inner.outbound.last_sent()
    }

    /// Delay until the next scheduled outbound retry, for the host's
    /// timer loop.
    pub fn pending_retry(&self) -> Option<Duration> {
        self.inner.outbound.pending_retry()
    }

    /// Invoked by the host when the retry delay elapses.
    pub fn on_retry_timer(&self) {
        self.inner.outbound.on_retry_timer();
    }

    /// Stops both streams and closes the transport. Idempotent.
    pub fn close(&self) {
        {
            let mut closed = self.inner.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.inner.outbound.stop();
        self.inner.inbound.stop();
        if let Err(error) = self.inner.transport.close() {
            warn!(%error, "transport close failed");
        }
    }
}

impl<T: Transport + 'static, S: ChangeStore + 'static> Drop for SyncedDb<T, S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport, S: ChangeStore> SessionInner<T, S> {
    /// Announces presence and seeds inbound watermarks from the store.
    fn announce(&self) -> SyncResult<()> {
        let last_seens = self.store.get_last_seens()?;
        self.inbound.prepare(&last_seens);
        self.transport.announce_presence(&AnnouncePresence {
            sender: self.store.site_id(),
            last_seens,
            schema_name: self.config.schema_name.clone(),
            schema_version: self.config.schema_version.clone(),
        })
    }
}

impl<T: Transport + 'static, S: ChangeStore + 'static> TransportHandler for SessionInner<T, S> {
    fn on_changes(&self, message: Changes) {
        if let Err(error) = self.inbound.receive_changes(message) {
            warn!(%error, "failed to apply inbound changeset");
        }
    }

    fn on_start_streaming(&self, message: StartStreaming) {
        debug!(since = %message.since, "peer opened our stream");
        self.outbound
            .start(message.since, message.exclude_sites, message.local_only);
    }

    fn on_reset_stream(&self, message: RejectChanges) {
        if message.whose != self.store.site_id() {
            debug!(whose = %message.whose, "ignoring reset for another site");
            return;
        }
        self.outbound.reset(message.since);
    }

    fn on_connected(&self) {
        // Clean reopen: resume, not restart, the causal state.
        if let Err(error) = self.announce() {
            warn!(%error, "re-announce after reconnect failed");
        }
    }
}
