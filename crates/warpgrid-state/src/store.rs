//! StateStore — redb-backed implementation of [`KvStore`].
//!
//! Every mutation, including single-key `put`/`delete`, runs through one
//! redb write transaction. redb serializes writers, so a transaction body
//! never observes a concurrent writer and commit cannot conflict. Committed
//! changes are published on a broadcast channel for cache sync. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::events::{SyncAction, SyncEvent};
use crate::kv::{KvEntry, KvStore, ListCb, Revision, Stm, StmApply};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Change events buffered per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Thread-safe backing store on top of redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<SyncEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        txn.open_table(OBJECT_META).map_err(map_err!(Table))?;
        txn.open_table(STORE_META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `body` in one write transaction.
    ///
    /// Commits and publishes change events if `body` succeeds and wrote
    /// something; aborts otherwise. A transaction without writes does not
    /// consume a revision.
    fn write<R>(
        &self,
        body: impl FnOnce(&mut StoreTxn<'_>) -> StateResult<R>,
    ) -> StateResult<(R, Revision)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = current_revision(&txn)?;
        let mut stm = StoreTxn {
            txn: &txn,
            rev: current + 1,
            changes: Vec::new(),
        };

        let out = match body(&mut stm) {
            Ok(out) => out,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(error = %e, "transaction aborted");
                return Err(e);
            }
        };
        let changes = stm.changes;

        if changes.is_empty() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok((out, current));
        }

        let rev = current + 1;
        {
            let mut meta = txn.open_table(STORE_META).map_err(map_err!(Table))?;
            meta.insert(REVISION_KEY, rev).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rev, changes = changes.len(), "transaction committed");

        self.publish(changes, rev);
        Ok((out, rev))
    }

    fn publish(&self, changes: Vec<Change>, rev: Revision) {
        let last = changes.len().saturating_sub(1);
        for (i, change) in changes.into_iter().enumerate() {
            // Sending only fails when nobody is subscribed.
            let _ = self.events.send(SyncEvent {
                action: change.action,
                key: change.key,
                value: change.value,
                rev,
                mod_rev: rev,
                more_events: i < last,
            });
        }
    }
}

fn current_revision(txn: &WriteTransaction) -> StateResult<Revision> {
    let table = txn.open_table(STORE_META).map_err(map_err!(Table))?;
    let rev = table
        .get(REVISION_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    Ok(rev)
}

/// A change recorded inside a transaction, published after commit.
struct Change {
    action: SyncAction,
    key: String,
    value: Vec<u8>,
}

/// [`Stm`] over an open redb write transaction.
struct StoreTxn<'t> {
    txn: &'t WriteTransaction,
    rev: Revision,
    changes: Vec<Change>,
}

impl StoreTxn<'_> {
    /// `(version, mod_rev)` of a key, if present.
    fn meta(&self, key: &str) -> StateResult<Option<(u64, Revision)>> {
        let table = self.txn.open_table(OBJECT_META).map_err(map_err!(Table))?;
        let meta = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        Ok(meta)
    }

    fn write_value(&mut self, key: &str, value: &[u8]) -> StateResult<()> {
        let version = self.meta(key)?.map_or(0, |(version, _)| version) + 1;
        {
            let mut objects = self.txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            objects.insert(key, value).map_err(map_err!(Write))?;
        }
        {
            let mut meta = self.txn.open_table(OBJECT_META).map_err(map_err!(Table))?;
            meta.insert(key, (version, self.rev))
                .map_err(map_err!(Write))?;
        }
        self.changes.push(Change {
            action: SyncAction::Update,
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn remove_value(&mut self, key: &str) -> StateResult<bool> {
        let existed = {
            let mut objects = self.txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            objects.remove(key).map_err(map_err!(Write))?.is_some()
        };
        if !existed {
            return Ok(false);
        }
        {
            let mut meta = self.txn.open_table(OBJECT_META).map_err(map_err!(Table))?;
            meta.remove(key).map_err(map_err!(Write))?;
        }
        self.changes.push(Change {
            action: SyncAction::Delete,
            key: key.to_string(),
            value: Vec::new(),
        });
        Ok(true)
    }
}

impl Stm for StoreTxn<'_> {
    fn get(&mut self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> StateResult<()> {
        self.write_value(key, value)
    }

    fn delete(&mut self, key: &str) -> StateResult<bool> {
        self.remove_value(key)
    }

    fn list(&mut self, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

impl KvStore for StateStore {
    fn get(&self, key: &str) -> StateResult<KvEntry> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let objects = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let meta = txn.open_table(OBJECT_META).map_err(map_err!(Table))?;

        let Some(value) = objects.get(key).map_err(map_err!(Read))? else {
            return Err(StateError::NotFound(key.to_string()));
        };
        let (version, mod_rev) = meta
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or((0, 0));
        Ok(KvEntry {
            value: value.value().to_vec(),
            version,
            mod_rev,
        })
    }

    fn put(&self, key: &str, value: &[u8]) -> StateResult<Revision> {
        let ((), rev) = self.write(|stm| stm.write_value(key, value))?;
        debug!(%key, rev, "key stored");
        Ok(rev)
    }

    fn delete(&self, key: &str) -> StateResult<Revision> {
        let (existed, rev) = self.write(|stm| stm.remove_value(key))?;
        debug!(%key, existed, rev, "key deleted");
        Ok(rev)
    }

    fn create(&self, key: &str, value: &[u8]) -> StateResult<Revision> {
        let ((), rev) = self.write(|stm| {
            if stm.meta(key)?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            stm.write_value(key, value)
        })?;
        Ok(rev)
    }

    fn update(&self, key: &str, value: &[u8], version: u64) -> StateResult<Revision> {
        let ((), rev) = self.write(|stm| {
            let Some((found, _)) = stm.meta(key)? else {
                return Err(StateError::NotFound(key.to_string()));
            };
            if version != 0 && version != found {
                return Err(StateError::VersionMismatch {
                    key: key.to_string(),
                    expected: version,
                    found,
                });
            }
            stm.write_value(key, value)
        })?;
        Ok(rev)
    }

    fn list(&self, prefix: &str, cb: &mut ListCb<'_>) -> StateResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let objects = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let meta = txn.open_table(OBJECT_META).map_err(map_err!(Table))?;

        for entry in objects.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let mod_rev = meta
                .get(key)
                .map_err(map_err!(Read))?
                .map_or(0, |guard| guard.value().1);
            cb(key, value.value(), mod_rev)?;
        }
        Ok(())
    }

    fn apply_stm(&self, apply: &mut StmApply<'_>) -> StateResult<Revision> {
        let ((), rev) = self.write(|stm| apply(stm))?;
        Ok(rev)
    }

    fn revision(&self) -> StateResult<Revision> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STORE_META).map_err(map_err!(Table))?;
        let rev = table
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(rev)
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
