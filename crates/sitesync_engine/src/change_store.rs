//! Change store interface and in-memory implementation.
//!
//! The conflict-resolution engine lives behind [`ChangeStore`]; the
//! sync layer only pulls, ships, and applies changesets through it.
//! [`MemoryChangeStore`] is a complete in-memory implementation used
//! by tests and embedders that do not need durability.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use sitesync_protocol::{Change, Scalar, Seq, SiteId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Outcome of applying a schema to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// Schema was applied to a fresh store.
    Applied,
    /// Store already carries this exact schema.
    Noop,
    /// Store was migrated from an older version of the same schema.
    Migrated,
}

/// Callback invoked after a local commit.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// The local data store, as seen by the sync layer.
///
/// Implementations must apply a changeset transactionally: `last_seen`
/// for the sending site is only advanced together with a durable
/// application of the whole batch.
pub trait ChangeStore: Send + Sync {
    /// This replica's immutable identity.
    fn site_id(&self) -> SiteId;

    /// Pulls the changes committed after `since`, oldest first.
    ///
    /// Changes originated by a site in `exclude_sites` are skipped;
    /// `local_only` restricts the result to this site's own writes.
    fn pull_changeset(
        &self,
        since: Seq,
        exclude_sites: &[SiteId],
        local_only: bool,
    ) -> SyncResult<Vec<Change>>;

    /// Applies a changeset and records `new_seen` for `from_site`,
    /// atomically.
    fn apply_changeset_and_set_last_seen(
        &self,
        changes: &[Change],
        from_site: SiteId,
        new_seen: Seq,
    ) -> SyncResult<()>;

    /// Returns the stored watermark for every known peer.
    fn get_last_seens(&self) -> SyncResult<Vec<(SiteId, Seq)>>;

    /// Returns the stored watermark for one peer.
    fn get_last_seen(&self, site: SiteId) -> SyncResult<Seq> {
        Ok(self
            .get_last_seens()?
            .into_iter()
            .find(|(s, _)| *s == site)
            .map(|(_, seq)| seq)
            .unwrap_or(Seq::ZERO))
    }

    /// Registers a commit callback; dropping the disposer detaches it.
    fn on_change(&self, callback: ChangeCallback) -> Disposer;

    /// Applies or migrates to the named schema.
    fn migrate_to(&self, schema_name: &str, schema_content: &str) -> SyncResult<MigrateOutcome>;
}

/// Observer registry for commit notifications.
///
/// An in-process fan-out list: subscribers register callbacks and get
/// back a [`Disposer`] guard. Callbacks run on the committing thread,
/// after the store's own locks are released.
pub struct ChangeObservers {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    subscribers: RwLock<Vec<(u64, ChangeCallback)>>,
    next_id: RwLock<u64>,
}

impl ChangeObservers {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: RwLock::new(1),
            }),
        }
    }

    /// Registers a callback and returns its disposer.
    pub fn subscribe(&self, callback: ChangeCallback) -> Disposer {
        let id = {
            let mut next = self.inner.next_id.write();
            let id = *next;
            *next += 1;
            id
        };
        self.inner.subscribers.write().push((id, callback));
        Disposer {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invokes every live callback.
    pub fn notify(&self) {
        let callbacks: Vec<ChangeCallback> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for ChangeObservers {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard detaching a change callback when dropped.
pub struct Disposer {
    id: u64,
    registry: Weak<ObserverInner>,
}

impl Disposer {
    /// Detaches the callback now. Safe to call more than once.
    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An in-memory change store.
///
/// Local writes get fresh db versions; applied remote changesets are
/// re-versioned under one fresh local version while preserving origin
/// site and column version, which is what lets this store relay one
/// peer's changes to another. Cell merging is a plain
/// highest-column-version-wins placeholder; the real merge engine is
/// external to the sync layer.
pub struct MemoryChangeStore {
    site_id: SiteId,
    state: RwLock<StoreState>,
    observers: ChangeObservers,
}

struct StoreState {
    log: Vec<Change>,
    cells: HashMap<(String, Vec<u8>, String), (u64, Scalar)>,
    next_version: u64,
    last_seens: HashMap<SiteId, Seq>,
    schema: Option<(String, String)>,
}

impl MemoryChangeStore {
    /// Creates a store with a fresh random site id.
    pub fn new() -> Self {
        Self::with_site_id(SiteId::random())
    }

    /// Creates a store with a fixed site id.
    pub fn with_site_id(site_id: SiteId) -> Self {
        Self {
            site_id,
            state: RwLock::new(StoreState {
                log: Vec::new(),
                cells: HashMap::new(),
                next_version: 1,
                last_seens: HashMap::new(),
                schema: None,
            }),
            observers: ChangeObservers::new(),
        }
    }

    /// Commits one local cell write and returns its log position.
    pub fn write(
        &self,
        table: impl Into<String>,
        pk: impl Into<Vec<u8>>,
        column: impl Into<String>,
        value: Scalar,
    ) -> Seq {
        let table = table.into();
        let pk = pk.into();
        let column = column.into();
        let seq;
        {
            let mut state = self.state.write();
            let version = state.next_version;
            state.next_version += 1;

            let key = (table.clone(), pk.clone(), column.clone());
            let col_version = state.cells.get(&key).map(|(v, _)| v + 1).unwrap_or(1);
            state.cells.insert(key, (col_version, value.clone()));
            state.log.push(Change {
                table,
                pk,
                column,
                value,
                col_version,
                db_version: version,
                origin_site: Some(self.site_id),
                causal_length: 1,
            });
            seq = Seq::new(version, 0);
        }
        self.observers.notify();
        seq
    }

    /// The store's current log position.
    pub fn current_version(&self) -> Seq {
        let state = self.state.read();
        Seq::new(state.next_version - 1, 0)
    }

    /// Current value of a cell, for assertions.
    pub fn value_of(&self, table: &str, pk: &[u8], column: &str) -> Option<Scalar> {
        let state = self.state.read();
        state
            .cells
            .get(&(table.to_string(), pk.to_vec(), column.to_string()))
            .map(|(_, value)| value.clone())
    }
}

impl Default for MemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeStore for MemoryChangeStore {
    fn site_id(&self) -> SiteId {
        self.site_id
    }

    fn pull_changeset(
        &self,
        since: Seq,
        exclude_sites: &[SiteId],
        local_only: bool,
    ) -> SyncResult<Vec<Change>> {
        let state = self.state.read();
        Ok(state
            .log
            .iter()
            .filter(|change| change.db_version > since.version)
            .filter(|change| match change.origin_site {
                Some(origin) => {
                    !exclude_sites.contains(&origin) && (!local_only || origin == self.site_id)
                }
                // No recorded origin means a local write.
                None => true,
            })
            .cloned()
            .collect())
    }

    fn apply_changeset_and_set_last_seen(
        &self,
        changes: &[Change],
        from_site: SiteId,
        new_seen: Seq,
    ) -> SyncResult<()> {
        {
            let mut state = self.state.write();
            let version = state.next_version;
            state.next_version += 1;

            for change in changes {
                let key = (change.table.clone(), change.pk.clone(), change.column.clone());
                let wins = state
                    .cells
                    .get(&key)
                    .map(|(existing, _)| change.col_version >= *existing)
                    .unwrap_or(true);
                if !wins {
                    continue;
                }
                state
                    .cells
                    .insert(key, (change.col_version, change.value.clone()));
                state.log.push(Change {
                    db_version: version,
                    origin_site: change.origin_site.or(Some(from_site)),
                    ..change.clone()
                });
            }
            state.last_seens.insert(from_site, new_seen);
        }
        self.observers.notify();
        Ok(())
    }

    fn get_last_seens(&self) -> SyncResult<Vec<(SiteId, Seq)>> {
        let state = self.state.read();
        let mut seens: Vec<(SiteId, Seq)> = state
            .last_seens
            .iter()
            .map(|(site, seq)| (*site, *seq))
            .collect();
        seens.sort_by_key(|(site, _)| *site);
        Ok(seens)
    }

    fn on_change(&self, callback: ChangeCallback) -> Disposer {
        self.observers.subscribe(callback)
    }

    fn migrate_to(&self, schema_name: &str, schema_content: &str) -> SyncResult<MigrateOutcome> {
        let mut state = self.state.write();
        match &state.schema {
            None => {
                state.schema = Some((schema_name.to_string(), schema_content.to_string()));
                Ok(MigrateOutcome::Applied)
            }
            Some((name, content)) if name == schema_name && content == schema_content => {
                Ok(MigrateOutcome::Noop)
            }
            Some((name, _)) if name == schema_name => {
                state.schema = Some((schema_name.to_string(), schema_content.to_string()));
                Ok(MigrateOutcome::Migrated)
            }
            Some(_) => Err(SyncError::SchemaConflict {
                schema_name: schema_name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    #[test]
    fn local_writes_bump_versions() {
        let store = MemoryChangeStore::with_site_id(site(1));
        assert_eq!(store.write("t", vec![1], "a", Scalar::Integer(1)), Seq::new(1, 0));
        assert_eq!(store.write("t", vec![1], "a", Scalar::Integer(2)), Seq::new(2, 0));
        assert_eq!(store.current_version(), Seq::new(2, 0));

        let changes = store.pull_changeset(Seq::ZERO, &[], false).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].col_version, 1);
        assert_eq!(changes[1].col_version, 2);
        assert_eq!(changes[1].value, Scalar::Integer(2));
    }

    #[test]
    fn pull_respects_since_and_exclusions() {
        let store = MemoryChangeStore::with_site_id(site(1));
        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![2], "a", Scalar::Integer(2));

        let since_one = store.pull_changeset(Seq::new(1, 0), &[], false).unwrap();
        assert_eq!(since_one.len(), 1);
        assert_eq!(since_one[0].db_version, 2);

        let excluded = store.pull_changeset(Seq::ZERO, &[site(1)], false).unwrap();
        assert!(excluded.is_empty());
    }

    #[test]
    fn apply_reversions_and_preserves_origin() {
        let a = MemoryChangeStore::with_site_id(site(1));
        let b = MemoryChangeStore::with_site_id(site(2));

        a.write("t", vec![1], "a", Scalar::Text("x".into()));
        let changes = a.pull_changeset(Seq::ZERO, &[], false).unwrap();

        b.apply_changeset_and_set_last_seen(&changes, site(1), Seq::new(1, 0))
            .unwrap();

        assert_eq!(b.get_last_seen(site(1)).unwrap(), Seq::new(1, 0));
        assert_eq!(b.value_of("t", &[1], "a"), Some(Scalar::Text("x".into())));

        // B's copy carries A's origin under B's own log version.
        let relayed = b.pull_changeset(Seq::ZERO, &[], false).unwrap();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].origin_site, Some(site(1)));
        assert_eq!(relayed[0].db_version, 1);

        // local_only hides relayed changes.
        let local = b.pull_changeset(Seq::ZERO, &[], true).unwrap();
        assert!(local.is_empty());
    }

    #[test]
    fn stale_column_versions_lose() {
        let store = MemoryChangeStore::with_site_id(site(1));
        store.write("t", vec![1], "a", Scalar::Integer(1));
        store.write("t", vec![1], "a", Scalar::Integer(2)); // col_version 2

        let stale = Change {
            table: "t".into(),
            pk: vec![1],
            column: "a".into(),
            value: Scalar::Integer(99),
            col_version: 1,
            db_version: 5,
            origin_site: Some(site(2)),
            causal_length: 1,
        };
        store
            .apply_changeset_and_set_last_seen(&[stale], site(2), Seq::new(5, 0))
            .unwrap();

        assert_eq!(store.value_of("t", &[1], "a"), Some(Scalar::Integer(2)));
    }

    #[test]
    fn observers_fire_after_commit() {
        let store = MemoryChangeStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let disposer = store.on_change(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        store.write("t", vec![1], "a", Scalar::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        disposer.dispose();
        store.write("t", vec![1], "a", Scalar::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disposer_drop_detaches() {
        let store = MemoryChangeStore::new();
        {
            let _disposer = store.on_change(Arc::new(|| {}));
            assert_eq!(store.observers.subscriber_count(), 1);
        }
        assert_eq!(store.observers.subscriber_count(), 0);
    }

    #[test]
    fn migrate_outcomes() {
        let store = MemoryChangeStore::new();
        assert_eq!(
            store.migrate_to("app", "v1 tables").unwrap(),
            MigrateOutcome::Applied
        );
        assert_eq!(
            store.migrate_to("app", "v1 tables").unwrap(),
            MigrateOutcome::Noop
        );
        assert_eq!(
            store.migrate_to("app", "v2 tables").unwrap(),
            MigrateOutcome::Migrated
        );
        assert!(matches!(
            store.migrate_to("other", "v1"),
            Err(SyncError::SchemaConflict { .. })
        ));
    }
}
