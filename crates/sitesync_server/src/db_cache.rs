//! Reference-counted cache of logical database handles.
//!
//! N clients syncing the same logical database share one open store
//! handle instead of re-opening and re-migrating it per connection.
//! The ref-count is the only arbitration mechanism: the handle is
//! evicted and dropped exactly when the count reaches zero.

use crate::error::{ServerError, ServerResult};
use parking_lot::Mutex;
use sitesync_engine::ChangeStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Opens store handles for logical databases.
///
/// The opener owns schema application: it must apply or migrate the
/// named schema (via the store's `migrate_to`) before returning the
/// handle, and fail on a schema conflict.
pub trait StoreOpener<S: ChangeStore>: Send + Sync {
    /// Opens the named database with the given schema.
    fn open(&self, db_name: &str, schema_name: &str, schema_version: &str)
        -> ServerResult<Arc<S>>;
}

impl<S, F> StoreOpener<S> for F
where
    S: ChangeStore,
    F: Fn(&str, &str, &str) -> ServerResult<Arc<S>> + Send + Sync,
{
    fn open(
        &self,
        db_name: &str,
        schema_name: &str,
        schema_version: &str,
    ) -> ServerResult<Arc<S>> {
        self(db_name, schema_name, schema_version)
    }
}

struct CacheEntry<S> {
    handle: Arc<S>,
    ref_count: usize,
    schema_name: String,
    schema_version: String,
}

/// Reference-counted registry mapping logical database names to open,
/// shared store handles.
pub struct DbCache<S: ChangeStore> {
    opener: Box<dyn StoreOpener<S>>,
    entries: Mutex<HashMap<String, CacheEntry<S>>>,
}

impl<S: ChangeStore> DbCache<S> {
    /// Creates an empty cache over the given opener.
    pub fn new(opener: impl StoreOpener<S> + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle for `db_name`, opening it on first use.
    ///
    /// A present entry's `(schema_name, schema_version)` must match
    /// the request exactly; a mismatch is a hard error and leaves the
    /// entry untouched.
    pub fn get_and_ref(
        &self,
        db_name: &str,
        schema_name: &str,
        schema_version: &str,
    ) -> ServerResult<Arc<S>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(db_name) {
            if entry.schema_name != schema_name || entry.schema_version != schema_version {
                return Err(ServerError::SchemaMismatch {
                    db_name: db_name.to_string(),
                    cached: format!("{}@{}", entry.schema_name, entry.schema_version),
                    requested: format!("{schema_name}@{schema_version}"),
                });
            }
            entry.ref_count += 1;
            return Ok(Arc::clone(&entry.handle));
        }

        let handle = self.opener.open(db_name, schema_name, schema_version)?;
        debug!(db = %db_name, schema = %schema_name, "opened database handle");
        entries.insert(
            db_name.to_string(),
            CacheEntry {
                handle: Arc::clone(&handle),
                ref_count: 1,
                schema_name: schema_name.to_string(),
                schema_version: schema_version.to_string(),
            },
        );
        Ok(handle)
    }

    /// Drops one reference; the handle closes when the count hits
    /// zero. Unreferencing below zero is an invariant violation.
    pub fn unref(&self, db_name: &str) -> ServerResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(db_name).ok_or_else(|| {
            error!(db = %db_name, "unref of database with no live references");
            ServerError::InvariantViolation(format!(
                "unref of {db_name:?} below zero references"
            ))
        })?;

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            entries.remove(db_name);
            debug!(db = %db_name, "closed database handle");
        }
        Ok(())
    }

    /// Current reference count for a database (0 when not cached).
    pub fn ref_count(&self, db_name: &str) -> usize {
        self.entries
            .lock()
            .get(db_name)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no handles are open.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
