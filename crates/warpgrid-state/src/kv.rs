//! The backing store contract.
//!
//! Everything above the store (caches, sync, upgrades) talks to it through
//! [`KvStore`] and, inside a transaction, through [`Stm`]. Both traits are
//! object-safe so upgrade functions can take `&dyn KvStore`.

use tokio::sync::broadcast;

use crate::error::StateResult;
use crate::events::SyncEvent;

/// Global store revision. Every committed write transaction increments it.
pub type Revision = u64;

/// A stored value together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    /// Number of writes to this key since it was created.
    pub version: u64,
    /// Revision of the transaction that last modified this key.
    pub mod_rev: Revision,
}

/// Callback invoked per entry by [`KvStore::list`]: `(key, value, mod_rev)`.
pub type ListCb<'a> = dyn FnMut(&str, &[u8], Revision) -> StateResult<()> + 'a;

/// Transaction body for [`KvStore::apply_stm`].
pub type StmApply<'a> = dyn FnMut(&mut dyn Stm) -> StateResult<()> + 'a;

/// Transactional key-value store.
pub trait KvStore: Send + Sync {
    /// Fetch a key. Fails with `NotFound` if absent.
    fn get(&self, key: &str) -> StateResult<KvEntry>;

    /// Write a key regardless of whether it exists.
    fn put(&self, key: &str, value: &[u8]) -> StateResult<Revision>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> StateResult<Revision>;

    /// Write a new key. Fails with `AlreadyExists` if present.
    fn create(&self, key: &str, value: &[u8]) -> StateResult<Revision>;

    /// Overwrite an existing key. Fails with `NotFound` if absent, or
    /// `VersionMismatch` if `version` is non-zero and differs from the
    /// key's current version.
    fn update(&self, key: &str, value: &[u8], version: u64) -> StateResult<Revision>;

    /// Stream every entry under `prefix` to `cb`, in key order. An error
    /// from `cb` stops the listing and is returned.
    fn list(&self, prefix: &str, cb: &mut ListCb<'_>) -> StateResult<()>;

    /// Run `apply` inside one atomic transaction. All writes commit
    /// together if it returns `Ok`; none survive if it returns `Err`.
    /// Returns the revision of the commit.
    fn apply_stm(&self, apply: &mut StmApply<'_>) -> StateResult<Revision>;

    /// Last committed revision.
    fn revision(&self) -> StateResult<Revision>;

    /// Subscribe to committed changes.
    fn subscribe(&self) -> broadcast::Receiver<SyncEvent>;
}

/// Transaction handle passed to [`KvStore::apply_stm`] bodies.
///
/// Reads observe the transaction's own earlier writes.
pub trait Stm {
    fn get(&mut self, key: &str) -> StateResult<Option<Vec<u8>>>;
    fn put(&mut self, key: &str, value: &[u8]) -> StateResult<()>;
    /// Returns true if the key existed.
    fn delete(&mut self, key: &str) -> StateResult<bool>;
    /// All `(key, value)` pairs under `prefix`, in key order.
    fn list(&mut self, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>;
}
