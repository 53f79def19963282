//! Connection broker.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::connection::SyncConnection;
use crate::db_cache::DbCache;
use crate::error::{ServerError, ServerResult};
use parking_lot::Mutex;
use sitesync_engine::{ChangeStore, Transport};
use sitesync_protocol::AnnouncePresence;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Demultiplexes many physical connections onto a small set of shared
/// database handles.
///
/// The host's accept loop decodes each new connection's announce and
/// hands it here with the database name and optional access token from
/// the session bootstrap parameters; the broker authenticates,
/// resolves the handle through the [`DbCache`], and owns the resulting
/// [`SyncConnection`] until the transport goes away.
pub struct ConnectionBroker<T: Transport + 'static, S: ChangeStore + 'static> {
    config: ServerConfig,
    cache: Arc<DbCache<S>>,
    validator: Option<TokenValidator>,
    connections: Mutex<HashMap<u64, SyncConnection<T, S>>>,
    next_id: Mutex<u64>,
}

impl<T: Transport + 'static, S: ChangeStore + 'static> ConnectionBroker<T, S> {
    /// Creates a broker over the given cache.
    pub fn new(config: ServerConfig, cache: Arc<DbCache<S>>) -> Self {
        let validator = config
            .auth_secret
            .as_ref()
            .map(|secret| TokenValidator::new(secret.clone(), config.token_expiry));
        Self {
            config,
            cache,
            validator,
            connections: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Opens a connection for an announcing client.
    ///
    /// Returns the connection id the host uses to tear the session
    /// down when the physical connection drops.
    pub fn open_connection(
        &self,
        db_name: &str,
        transport: Arc<T>,
        announce: AnnouncePresence,
        token: Option<&str>,
    ) -> ServerResult<u64> {
        if self.connection_count() >= self.config.max_connections {
            return Err(ServerError::InvalidRequest(
                "connection limit reached".into(),
            ));
        }

        if self.config.require_auth {
            let validator = self.validator.as_ref().ok_or_else(|| {
                ServerError::InvariantViolation("auth required but no secret configured".into())
            })?;
            let token = token.ok_or_else(|| {
                ServerError::AuthenticationFailed("missing access token".into())
            })?;
            validator.validate_token(token, announce.sender, db_name)?;
        }

        let connection = SyncConnection::establish(
            db_name,
            Arc::clone(&self.cache),
            transport,
            &announce,
            self.config.backoff.clone(),
        )?;

        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        info!(id, db = %db_name, client = %announce.sender, "connection opened");
        self.connections.lock().insert(id, connection);
        Ok(id)
    }

    /// Looks up a live connection.
    pub fn connection(&self, id: u64) -> Option<SyncConnection<T, S>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Closes and forgets a connection. Returns false for unknown ids.
    pub fn close_connection(&self, id: u64) -> bool {
        let connection = self.connections.lock().remove(&id);
        match connection {
            Some(connection) => {
                connection.close();
                true
            }
            None => {
                warn!(id, "close of unknown connection");
                false
            }
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Closes every live connection.
    pub fn close_all(&self) {
        let connections: Vec<SyncConnection<T, S>> = {
            let mut map = self.connections.lock();
            map.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            connection.close();
        }
    }

    /// The shared database cache.
    pub fn cache(&self) -> &Arc<DbCache<S>> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_engine::{MemoryChangeStore, MockTransport};
    use sitesync_protocol::{Seq, SiteId};
    use std::time::Duration;

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    fn cache() -> Arc<DbCache<MemoryChangeStore>> {
        Arc::new(DbCache::new(|_db: &str, schema: &str, version: &str| {
            let store = Arc::new(MemoryChangeStore::with_site_id(site(0xaa)));
            store.migrate_to(schema, version)?;
            Ok(store)
        }))
    }

    fn announce(sender: SiteId) -> AnnouncePresence {
        AnnouncePresence {
            sender,
            last_seens: vec![],
            schema_name: "s".into(),
            schema_version: "1".into(),
        }
    }

    fn announce_with_schema(sender: SiteId, version: &str) -> AnnouncePresence {
        AnnouncePresence {
            schema_version: version.into(),
            ..announce(sender)
        }
    }

    #[test]
    fn clients_on_one_database_share_a_handle() {
        let broker = ConnectionBroker::new(ServerConfig::default(), cache());

        let t1 = Arc::new(MockTransport::new());
        let t2 = Arc::new(MockTransport::new());
        let id1 = broker
            .open_connection("dbA", t1, announce(site(1)), None)
            .unwrap();
        let id2 = broker
            .open_connection("dbA", t2, announce(site(2)), None)
            .unwrap();

        assert_eq!(broker.connection_count(), 2);
        assert_eq!(broker.cache().ref_count("dbA"), 2);

        let c1 = broker.connection(id1).unwrap();
        let c2 = broker.connection(id2).unwrap();
        assert!(Arc::ptr_eq(c1.store(), c2.store()));
    }

    #[test]
    fn closing_connections_releases_the_handle() {
        let broker = ConnectionBroker::new(ServerConfig::default(), cache());
        let id1 = broker
            .open_connection("dbA", Arc::new(MockTransport::new()), announce(site(1)), None)
            .unwrap();
        let id2 = broker
            .open_connection("dbA", Arc::new(MockTransport::new()), announce(site(2)), None)
            .unwrap();

        assert!(broker.close_connection(id1));
        assert_eq!(broker.cache().ref_count("dbA"), 1);
        assert!(broker.close_connection(id2));
        assert!(broker.cache().is_empty());

        assert!(!broker.close_connection(id1));
    }

    #[test]
    fn schema_mismatch_only_fails_the_requesting_connection() {
        let broker = ConnectionBroker::new(ServerConfig::default(), cache());
        let id1 = broker
            .open_connection(
                "dbA",
                Arc::new(MockTransport::new()),
                announce_with_schema(site(1), "1"),
                None,
            )
            .unwrap();

        let result = broker.open_connection(
            "dbA",
            Arc::new(MockTransport::new()),
            announce_with_schema(site(2), "2"),
            None,
        );
        assert!(matches!(result, Err(ServerError::SchemaMismatch { .. })));

        // The first session is untouched.
        assert_eq!(broker.connection_count(), 1);
        assert!(!broker.connection(id1).unwrap().is_closed());
        assert_eq!(broker.cache().ref_count("dbA"), 1);
    }

    #[test]
    fn auth_is_enforced_when_configured() {
        let secret = b"test-secret-key-32-bytes-long!!".to_vec();
        let config = ServerConfig::new().with_auth(secret.clone());
        let broker = ConnectionBroker::new(config, cache());

        let missing = broker.open_connection(
            "dbA",
            Arc::new(MockTransport::new()),
            announce(site(1)),
            None,
        );
        assert!(matches!(
            missing,
            Err(ServerError::AuthenticationFailed(_))
        ));

        let validator = TokenValidator::new(secret, Duration::from_secs(3600));
        let token = validator.create_token(site(1), "dbA");
        broker
            .open_connection(
                "dbA",
                Arc::new(MockTransport::new()),
                announce(site(1)),
                Some(&token),
            )
            .unwrap();

        // A token for a different database is refused.
        let wrong = broker.open_connection(
            "dbB",
            Arc::new(MockTransport::new()),
            announce(site(1)),
            Some(&token),
        );
        assert!(matches!(wrong, Err(ServerError::AuthenticationFailed(_))));
    }

    #[test]
    fn connection_limit_is_enforced() {
        let broker =
            ConnectionBroker::new(ServerConfig::new().with_max_connections(1), cache());
        broker
            .open_connection("dbA", Arc::new(MockTransport::new()), announce(site(1)), None)
            .unwrap();

        let result = broker.open_connection(
            "dbA",
            Arc::new(MockTransport::new()),
            announce(site(2)),
            None,
        );
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn close_all_drains_every_session() {
        let broker = ConnectionBroker::new(ServerConfig::default(), cache());
        broker
            .open_connection("dbA", Arc::new(MockTransport::new()), announce(site(1)), None)
            .unwrap();
        broker
            .open_connection("dbB", Arc::new(MockTransport::new()), announce(site(2)), None)
            .unwrap();

        broker.close_all();
        assert_eq!(broker.connection_count(), 0);
        assert!(broker.cache().is_empty());
    }
}
