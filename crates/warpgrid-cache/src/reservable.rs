//! Free reservable cluster index.
//!
//! Reservable cluster instances are created by the platform ahead of time
//! and handed to a tenant on demand. Finding a free one by scanning every
//! cluster instance is too slow on the hot path, so this index keeps the
//! free ones bucketed by cloudlet. It follows the primary cache through its
//! updated/deleted callbacks and never holds an entry the cache does not.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::cache::ObjectCache;
use crate::object::CacheObject;
use crate::objects::{ClusterInst, CloudletKey};

/// An object that can be reserved, grouped by the host it lives on.
pub trait Reservable: CacheObject {
    type HostKey: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static;

    fn host_key(&self) -> Self::HostKey;
    fn is_reservable(&self) -> bool;
    fn is_reserved(&self) -> bool;
}

impl Reservable for ClusterInst {
    type HostKey = CloudletKey;

    fn host_key(&self) -> CloudletKey {
        self.key.cloudlet_key.clone()
    }

    fn is_reservable(&self) -> bool {
        self.reservable
    }

    fn is_reserved(&self) -> bool {
        !self.reserved_by.is_empty()
    }
}

type Buckets<T> = HashMap<<T as Reservable>::HostKey, HashMap<<T as CacheObject>::Key, T>>;

/// Free, reservable objects bucketed by host.
pub struct FreeReservableIndex<T: Reservable> {
    buckets: Mutex<Buckets<T>>,
}

impl<T: Reservable> Default for FreeReservableIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reservable> FreeReservableIndex<T> {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets<T>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `obj` if it is free and reservable, otherwise drop it.
    pub fn update(&self, obj: &T) {
        let mut buckets = self.lock();
        let host = obj.host_key();
        if obj.is_reservable() && !obj.is_reserved() {
            buckets
                .entry(host)
                .or_default()
                .insert(obj.key().clone(), obj.clone());
        } else {
            remove_entry(&mut buckets, &host, obj.key());
        }
    }

    pub fn delete(&self, obj: &T) {
        let mut buckets = self.lock();
        remove_entry(&mut buckets, &obj.host_key(), obj.key());
    }

    /// Drop every entry whose key is not in `valid_keys`.
    pub fn prune(&self, valid_keys: &HashSet<T::Key>) {
        let mut buckets = self.lock();
        for bucket in buckets.values_mut() {
            bucket.retain(|key, _| valid_keys.contains(key));
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
    }

    /// Any free object on `host`.
    pub fn get_for_host(&self, host: &T::HostKey) -> Option<T::Key> {
        self.get_for_host_matching(host, |_| true)
    }

    /// A free object on `host` accepted by `pred`, smallest key first.
    pub fn get_for_host_matching(
        &self,
        host: &T::HostKey,
        pred: impl Fn(&T) -> bool,
    ) -> Option<T::Key> {
        let buckets = self.lock();
        buckets
            .get(host)?
            .iter()
            .filter(|(_, obj)| pred(obj))
            .map(|(key, _)| key)
            .min()
            .cloned()
    }

    pub fn count_for_host(&self, host: &T::HostKey) -> usize {
        self.lock().get(host).map_or(0, HashMap::len)
    }

    pub fn host_count(&self) -> usize {
        self.lock().len()
    }

    /// Follow `cache`'s mutation stream.
    pub fn attach(self: &Arc<Self>, cache: &ObjectCache<T>) {
        let index = Arc::clone(self);
        cache.add_updated_cb(move |_old, new| index.update(new));
        let index = Arc::clone(self);
        cache.add_deleted_cb(move |obj| index.delete(obj));
        debug!(typ = T::TYPE_NAME, "free reservable index attached");
    }
}

fn remove_entry<T: Reservable>(buckets: &mut Buckets<T>, host: &T::HostKey, key: &T::Key) {
    if let Some(bucket) = buckets.get_mut(host) {
        bucket.remove(key);
        if bucket.is_empty() {
            buckets.remove(host);
        }
    }
}
