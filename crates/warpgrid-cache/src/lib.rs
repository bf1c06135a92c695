//! warpgrid-cache — in-memory object caches for the WarpGrid controller.
//!
//! Each object type gets an [`ObjectCache`] that mirrors the backing store
//! and notifies dependent subsystems of changes. On top of the caches:
//!
//! - [`info`] tracks the remote execution state of objects and rejects
//!   conflicting state reports
//! - [`reservable`] keeps a per-cloudlet index of free reservable cluster
//!   instances, updated from the cache's mutation stream
//! - [`notify_order`] ranks object types so dependencies are always sent
//!   before the objects that reference them
//! - [`sync`] feeds store change events into the registered caches in
//!   notify order
//!
//! # Architecture
//!
//! ```text
//! StateStore ──SyncEvent──▶ CacheSync ──(NotifyOrder batches)──▶ ObjectCache<T>
//!                                                                   │
//!                                     notify / updated / deleted callbacks
//!                                                                   ▼
//!                                                   FreeReservableIndex, replication
//! ```

pub mod cache;
pub mod error;
pub mod filter;
pub mod info;
pub mod notify_order;
pub mod object;
pub mod objects;
pub mod reservable;
pub mod state;
pub mod sync;

pub use cache::ObjectCache;
pub use error::{CacheError, CacheResult};
pub use info::{InfoObject, StatusReset};
pub use notify_order::{DependencyMap, NotifyOrder, default_dependencies};
pub use object::{
    CacheObject, Modify, ObjectKey, decode_object, key_string, object_db_key, parse_object_key,
};
pub use objects::*;
pub use reservable::{FreeReservableIndex, Reservable};
pub use state::{StatusInfo, TrackedState, state_conflict};
pub use sync::{CacheSync, SyncCache, SyncStats};
