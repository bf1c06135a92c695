//! Cache sync — applies the store's change feed to registered caches.
//!
//! Events that share a revision arrive together (`more_events` is set on
//! all but the last). Updates within a revision are buffered and applied in
//! notify order, so a cache never sees an object before the objects it
//! references. A full resync replays every registered prefix between
//! `ListStart` and `ListEnd` markers; caches drop whatever was not listed.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use warpgrid_state::{
    KvStore, Revision, StateResult, SyncAction, SyncEvent, db_key_prefix, parse_db_key,
};

use crate::notify_order::NotifyOrder;

/// Type-erased view of a cache, as driven by [`CacheSync`].
pub trait SyncCache: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn sync_update(&self, key: &str, value: &[u8], rev: Revision, mod_rev: Revision);
    fn sync_delete(&self, key: &str, rev: Revision, mod_rev: Revision);
    fn sync_list_start(&self);
    fn sync_list_end(&self);
}

/// Result of a full resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub types: usize,
    pub entries: usize,
    pub rev: Revision,
}

/// Dispatches store events to caches by type name.
pub struct CacheSync {
    caches: HashMap<String, Arc<dyn SyncCache>>,
    order: NotifyOrder,
    /// Updates of the revision in progress, kept in notify order.
    batch: Vec<SyncEvent>,
    rev: Revision,
    synced: bool,
}

impl CacheSync {
    pub fn new(order: NotifyOrder) -> Self {
        Self {
            caches: HashMap::new(),
            order,
            batch: Vec::new(),
            rev: 0,
            synced: false,
        }
    }

    pub fn register(&mut self, cache: Arc<dyn SyncCache>) {
        debug!(typ = cache.type_name(), "registered cache for sync");
        self.caches.insert(cache.type_name().to_string(), cache);
    }

    /// Last revision applied.
    pub fn rev(&self) -> Revision {
        self.rev
    }

    /// A full listing has completed at least once.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn handle(&mut self, event: &SyncEvent) {
        match event.action {
            SyncAction::ListStart => {
                self.batch.clear();
                for cache in self.caches.values() {
                    cache.sync_list_start();
                }
            }
            SyncAction::ListEnd => {
                self.flush();
                for cache in self.caches.values() {
                    cache.sync_list_end();
                }
                self.synced = true;
            }
            SyncAction::Update | SyncAction::List => {
                self.insert_batch(event.clone());
                if !event.more_events {
                    self.flush();
                }
            }
            SyncAction::Delete => {
                if let Some(cache) = self.cache_for(&event.key) {
                    cache.sync_delete(&event.key, event.rev, event.mod_rev);
                }
                if !event.more_events {
                    self.flush();
                }
            }
        }
        self.rev = self.rev.max(event.rev);
    }

    fn insert_batch(&mut self, event: SyncEvent) {
        let (typ, _) = parse_db_key(&event.key);
        let pos = self
            .batch
            .iter()
            .position(|queued| self.order.less(typ, parse_db_key(&queued.key).0))
            .unwrap_or(self.batch.len());
        self.batch.insert(pos, event);
    }

    fn flush(&mut self) {
        for event in std::mem::take(&mut self.batch) {
            if let Some(cache) = self.cache_for(&event.key) {
                cache.sync_update(&event.key, &event.value, event.rev, event.mod_rev);
            }
        }
    }

    fn cache_for(&self, key: &str) -> Option<&Arc<dyn SyncCache>> {
        let (typ, _) = parse_db_key(key);
        let cache = self.caches.get(typ);
        if cache.is_none() {
            debug!(%key, "no cache for key, skipped");
        }
        cache
    }

    /// Rebuild every registered cache from a full listing of the store.
    pub fn resync(&mut self, store: &dyn KvStore) -> StateResult<SyncStats> {
        let rev = store.revision()?;
        self.handle(&SyncEvent::marker(SyncAction::ListStart, rev));

        let mut types: Vec<String> = self.caches.keys().cloned().collect();
        types.sort();
        self.order.sort_types(&mut types);

        let mut entries = 0;
        for typ in &types {
            let Some(cache) = self.caches.get(typ) else {
                continue;
            };
            store.list(&db_key_prefix(typ), &mut |key, value, mod_rev| {
                cache.sync_update(key, value, rev, mod_rev);
                entries += 1;
                Ok(())
            })?;
        }

        self.handle(&SyncEvent::marker(SyncAction::ListEnd, rev));
        info!(types = types.len(), entries, rev, "cache resync complete");
        Ok(SyncStats {
            types: types.len(),
            entries,
            rev,
        })
    }
}
