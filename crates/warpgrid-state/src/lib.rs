//! warpgrid-state — the controller's backing store.
//!
//! Backed by [redb](https://docs.rs/redb), provides a transactional
//! key-value store that the object caches and the upgrade engine are
//! built on.
//!
//! # Architecture
//!
//! Every object type lives under its own key prefix (`{Type}/{key}`),
//! with values stored as JSON bytes. Each committed write transaction
//! bumps a single global revision; per-key metadata records the key's
//! version (number of writes since creation) and its last-modified
//! revision.
//!
//! The [`KvStore`] trait is the contract the rest of the controller
//! depends on. [`StateStore`] implements it on top of redb and publishes
//! a [`SyncEvent`] for every committed change so caches can follow the
//! store without polling.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod events;
pub mod keys;
pub mod kv;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use events::{SyncAction, SyncEvent};
pub use keys::{VERSION_KEY, db_key, db_key_prefix, parse_db_key};
pub use kv::{KvEntry, KvStore, Revision, Stm};
pub use store::StateStore;
