//! ObjectCache — in-memory replica of one object type.
//!
//! The cache is fed by the store's change stream (see [`crate::sync`]) and
//! read by controller logic. Every operation takes a single mutex for the
//! duration of the map access only. Change callbacks are captured while the
//! lock is held and invoked after it is released, so a callback may call
//! back into the same cache (or any other) without deadlocking.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use warpgrid_state::Revision;

use crate::filter::Filter;
use crate::object::{CacheObject, Modify, decode_object, parse_object_key};
use crate::sync::SyncCache;

/// Called with the key of every added, changed, or removed object.
pub type NotifyCb<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Called with the previous value (if any) and the new value of an update.
pub type UpdatedCb<T> = Arc<dyn Fn(Option<&T>, &T) + Send + Sync>;

/// Called with the removed value of a delete, prune, or sync sweep.
pub type DeletedCb<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    obj: T,
    mod_rev: Revision,
}

struct Inner<T: CacheObject> {
    objs: HashMap<T::Key, Entry<T>>,
    /// Keys seen since `sync_list_start`, `None` outside a resync.
    sync_list: Option<HashSet<T::Key>>,
    notify_cbs: Vec<NotifyCb<T::Key>>,
    updated_cbs: Vec<UpdatedCb<T>>,
    deleted_cbs: Vec<DeletedCb<T>>,
}

enum Change<T: CacheObject> {
    Updated {
        key: T::Key,
        /// Old/new snapshot, only captured when someone listens for it.
        diff: Option<(Option<T>, T)>,
    },
    Deleted(T),
}

/// Changes made under the lock and the callbacks to tell about them.
struct Pending<T: CacheObject> {
    notify_cbs: Vec<NotifyCb<T::Key>>,
    updated_cbs: Vec<UpdatedCb<T>>,
    deleted_cbs: Vec<DeletedCb<T>>,
    changes: Vec<Change<T>>,
}

impl<T: CacheObject> Inner<T> {
    fn pending(&self) -> Pending<T> {
        Pending {
            notify_cbs: self.notify_cbs.clone(),
            updated_cbs: self.updated_cbs.clone(),
            deleted_cbs: self.deleted_cbs.clone(),
            changes: Vec::new(),
        }
    }

    fn insert(&mut self, obj: T, mod_rev: Revision, pending: &mut Pending<T>) {
        let key = obj.key().clone();
        let diff = if pending.updated_cbs.is_empty() {
            None
        } else {
            let old = self.objs.get(&key).map(|entry| entry.obj.clone());
            Some((old, obj.clone()))
        };
        debug!(typ = T::TYPE_NAME, ?key, mod_rev, "cache update");
        self.objs.insert(key.clone(), Entry { obj, mod_rev });
        pending.changes.push(Change::Updated { key, diff });
    }

    fn remove(&mut self, key: &T::Key, pending: &mut Pending<T>) -> bool {
        match self.objs.remove(key) {
            Some(entry) => {
                debug!(typ = T::TYPE_NAME, ?key, "cache delete");
                pending.changes.push(Change::Deleted(entry.obj));
                true
            }
            None => false,
        }
    }
}

impl<T: CacheObject> Pending<T> {
    /// Invoke callbacks. Must be called with the cache lock released.
    fn fire(self) {
        for change in &self.changes {
            match change {
                Change::Updated { key, diff } => {
                    for cb in &self.notify_cbs {
                        cb(key);
                    }
                    if let Some((old, new)) = diff {
                        for cb in &self.updated_cbs {
                            cb(old.as_ref(), new);
                        }
                    }
                }
                Change::Deleted(obj) => {
                    for cb in &self.notify_cbs {
                        cb(obj.key());
                    }
                    for cb in &self.deleted_cbs {
                        cb(obj);
                    }
                }
            }
        }
    }
}

/// Thread-safe cache of one object type.
pub struct ObjectCache<T: CacheObject> {
    inner: Mutex<Inner<T>>,
}

impl<T: CacheObject> Default for ObjectCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheObject> ObjectCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objs: HashMap::new(),
                sync_list: None,
                notify_cbs: Vec::new(),
                updated_cbs: Vec::new(),
                deleted_cbs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // Callbacks never run under the lock, so a poisoned map is still
        // consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Copy of the cached object.
    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.lock().objs.get(key).map(|entry| entry.obj.clone())
    }

    /// Copy of the cached object and the revision it was last written at.
    pub fn get_with_rev(&self, key: &T::Key) -> Option<(T, Revision)> {
        self.lock()
            .objs
            .get(key)
            .map(|entry| (entry.obj.clone(), entry.mod_rev))
    }

    pub fn has_key(&self, key: &T::Key) -> bool {
        self.lock().objs.contains_key(key)
    }

    pub fn get_all_keys(&self) -> BTreeSet<T::Key> {
        self.lock().objs.keys().cloned().collect()
    }

    pub fn get_count(&self) -> usize {
        self.lock().objs.len()
    }

    /// Call `cb` for every object matching `filter`, in key order.
    ///
    /// Matching objects are copied out under the lock; `cb` runs after it
    /// is released. The first error from `cb` stops the walk and is
    /// returned.
    pub fn show<E>(
        &self,
        filter: Option<&T>,
        mut cb: impl FnMut(&T) -> Result<(), E>,
    ) -> Result<(), E>
    where
        T: Default,
    {
        let filter = filter.and_then(Filter::new);
        let mut matched: Vec<T> = {
            let inner = self.lock();
            inner
                .objs
                .values()
                .map(|entry| &entry.obj)
                .filter(|obj| filter.as_ref().is_none_or(|f| f.matches(*obj)))
                .cloned()
                .collect()
        };
        matched.sort_by(|a, b| a.key().cmp(b.key()));
        debug!(typ = T::TYPE_NAME, count = matched.len(), "show");

        for obj in &matched {
            cb(obj)?;
        }
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert or replace the object stored under its key.
    pub fn update(&self, obj: T, rev: Revision) {
        let pending = {
            let mut inner = self.lock();
            let mut pending = inner.pending();
            inner.insert(obj, rev, &mut pending);
            pending
        };
        pending.fire();
    }

    /// Atomic read-modify-write of one key.
    ///
    /// `modify` sees the current value (or `None`) while the lock is held
    /// and must not call back into this cache. The value is only written
    /// when it returns [`Modify::Apply`]; callbacks fire after the lock is
    /// released. Returns whether a value was written, or the rejection.
    pub fn update_mod_func<E>(
        &self,
        key: &T::Key,
        rev: Revision,
        modify: impl FnOnce(Option<&T>) -> Modify<T, E>,
    ) -> Result<bool, E> {
        let pending = {
            let mut inner = self.lock();
            let current = inner.objs.get(key).map(|entry| &entry.obj);
            match modify(current) {
                Modify::Apply(obj) => {
                    debug_assert!(obj.key() == key, "update_mod_func changed the key");
                    let mut pending = inner.pending();
                    inner.insert(obj, rev, &mut pending);
                    pending
                }
                Modify::Unchanged => return Ok(false),
                Modify::Reject(err) => return Err(err),
            }
        };
        pending.fire();
        Ok(true)
    }

    /// Remove the object with `obj`'s key. Returns whether it was cached.
    pub fn delete(&self, obj: &T, rev: Revision) -> bool {
        self.delete_key(obj.key(), rev)
    }

    pub fn delete_key(&self, key: &T::Key, rev: Revision) -> bool {
        let (removed, pending) = {
            let mut inner = self.lock();
            let mut pending = inner.pending();
            let removed = inner.remove(key, &mut pending);
            (removed, pending)
        };
        if removed {
            debug!(typ = T::TYPE_NAME, ?key, rev, "deleted from cache");
        }
        pending.fire();
        removed
    }

    /// Remove every object whose key is not in `valid_keys`.
    /// Returns the number removed.
    pub fn prune(&self, valid_keys: &HashSet<T::Key>) -> usize {
        let pending = {
            let mut inner = self.lock();
            let stale: Vec<T::Key> = inner
                .objs
                .keys()
                .filter(|key| !valid_keys.contains(*key))
                .cloned()
                .collect();
            let mut pending = inner.pending();
            for key in &stale {
                inner.remove(key, &mut pending);
            }
            pending
        };
        let removed = pending.changes.len();
        if removed > 0 {
            debug!(typ = T::TYPE_NAME, removed, "pruned cache");
        }
        pending.fire();
        removed
    }

    // ── Callback registration ──────────────────────────────────────

    /// Replace all key-changed callbacks with `cb`.
    pub fn set_notify_cb(&self, cb: impl Fn(&T::Key) + Send + Sync + 'static) {
        self.lock().notify_cbs = vec![Arc::new(cb)];
    }

    pub fn add_notify_cb(&self, cb: impl Fn(&T::Key) + Send + Sync + 'static) {
        self.lock().notify_cbs.push(Arc::new(cb));
    }

    /// Replace all old/new callbacks with `cb`.
    pub fn set_updated_cb(&self, cb: impl Fn(Option<&T>, &T) + Send + Sync + 'static) {
        self.lock().updated_cbs = vec![Arc::new(cb)];
    }

    pub fn add_updated_cb(&self, cb: impl Fn(Option<&T>, &T) + Send + Sync + 'static) {
        self.lock().updated_cbs.push(Arc::new(cb));
    }

    pub fn add_deleted_cb(&self, cb: impl Fn(&T) + Send + Sync + 'static) {
        self.lock().deleted_cbs.push(Arc::new(cb));
    }
}

impl<T: CacheObject> SyncCache for ObjectCache<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn sync_update(&self, key: &str, value: &[u8], _rev: Revision, mod_rev: Revision) {
        let obj: T = match decode_object(value) {
            Ok(obj) => obj,
            Err(e) => {
                // Keep the last good value.
                warn!(%key, error = %e, "update dropped");
                return;
            }
        };
        let pending = {
            let mut inner = self.lock();
            let obj_key = obj.key().clone();
            if let Some(seen) = inner.sync_list.as_mut() {
                seen.insert(obj_key);
            }
            let mut pending = inner.pending();
            inner.insert(obj, mod_rev, &mut pending);
            pending
        };
        pending.fire();
    }

    fn sync_delete(&self, key: &str, rev: Revision, _mod_rev: Revision) {
        match parse_object_key::<T>(key) {
            Ok(obj_key) => {
                self.delete_key(&obj_key, rev);
            }
            Err(e) => {
                warn!(%key, error = %e, "delete dropped");
            }
        }
    }

    fn sync_list_start(&self) {
        self.lock().sync_list = Some(HashSet::new());
    }

    fn sync_list_end(&self) {
        let pending = {
            let mut inner = self.lock();
            let Some(seen) = inner.sync_list.take() else {
                warn!(typ = T::TYPE_NAME, "sync list end without start, ignored");
                return;
            };
            let stale: Vec<T::Key> = inner
                .objs
                .keys()
                .filter(|key| !seen.contains(*key))
                .cloned()
                .collect();
            let mut pending = inner.pending();
            for key in &stale {
                inner.remove(key, &mut pending);
            }
            debug!(
                typ = T::TYPE_NAME,
                listed = seen.len(),
                removed = stale.len(),
                "sync list complete"
            );
            pending
        };
        pending.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
    struct TestKey {
        org: String,
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct TestObj {
        key: TestKey,
        uri: String,
        count: u32,
    }

    impl CacheObject for TestObj {
        type Key = TestKey;
        const TYPE_NAME: &'static str = "TestObj";

        fn key(&self) -> &TestKey {
            &self.key
        }
    }

    fn key(name: &str) -> TestKey {
        TestKey {
            org: "acme".to_string(),
            name: name.to_string(),
        }
    }

    fn obj(name: &str, count: u32) -> TestObj {
        TestObj {
            key: key(name),
            uri: format!("{name}.edge.example"),
            count,
        }
    }

    fn db_key_for(name: &str) -> String {
        crate::object::object_db_key::<TestObj>(&key(name)).unwrap()
    }

    fn encode(o: &TestObj) -> Vec<u8> {
        serde_json::to_vec(o).unwrap()
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn record_events(cache: &ObjectCache<TestObj>) -> Log {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        cache.add_notify_cb(move |k| l.lock().unwrap().push(format!("notify:{}", k.name)));
        let l = log.clone();
        cache.add_updated_cb(move |old, new| {
            let old = old.map_or("none".to_string(), |o| o.count.to_string());
            l.lock()
                .unwrap()
                .push(format!("updated:{}:{}->{}", new.key.name, old, new.count));
        });
        let l = log.clone();
        cache.add_deleted_cb(move |o| l.lock().unwrap().push(format!("deleted:{}", o.key.name)));
        log
    }

    // ── Reads and writes ───────────────────────────────────────────

    #[test]
    fn get_returns_independent_copy() {
        let cache = ObjectCache::new();
        let original = obj("a", 1);
        cache.update(original.clone(), 1);

        let mut copy = cache.get(&key("a")).unwrap();
        assert_eq!(copy, original);

        copy.count = 99;
        copy.uri.clear();
        assert_eq!(cache.get(&key("a")).unwrap(), original);
    }

    #[test]
    fn update_replaces_and_records_revision() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 3);
        cache.update(obj("a", 2), 7);

        let (value, rev) = cache.get_with_rev(&key("a")).unwrap();
        assert_eq!(value.count, 2);
        assert_eq!(rev, 7);
        assert_eq!(cache.get_count(), 1);
    }

    #[test]
    fn enumeration() {
        let cache = ObjectCache::new();
        cache.update(obj("b", 1), 1);
        cache.update(obj("a", 1), 1);

        assert!(cache.has_key(&key("a")));
        assert!(!cache.has_key(&key("z")));
        let keys: Vec<_> = cache.get_all_keys().into_iter().map(|k| k.name).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(cache.type_name(), "TestObj");
    }

    #[test]
    fn notify_fires_before_updated_with_old_and_new() {
        let cache = ObjectCache::new();
        let log = record_events(&cache);

        cache.update(obj("a", 1), 1);
        cache.update(obj("a", 2), 2);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "notify:a",
                "updated:a:none->1",
                "notify:a",
                "updated:a:1->2",
            ]
        );
    }

    #[test]
    fn callbacks_may_reenter_the_cache() {
        let cache = Arc::new(ObjectCache::<TestObj>::new());
        let seen = Arc::new(Mutex::new(None));

        let c = Arc::clone(&cache);
        let s = Arc::clone(&seen);
        cache.set_notify_cb(move |k| {
            *s.lock().unwrap() = c.get(k).map(|o| o.count);
        });

        cache.update(obj("a", 5), 1);
        assert_eq!(*seen.lock().unwrap(), Some(5));
    }

    #[test]
    fn set_notify_cb_replaces_previous_callbacks() {
        let cache = ObjectCache::new();
        let log = record_events(&cache);
        cache.set_notify_cb(|_| {});

        cache.update(obj("a", 1), 1);
        assert_eq!(*log.lock().unwrap(), vec!["updated:a:none->1"]);
    }

    // ── Read-modify-write ──────────────────────────────────────────

    #[test]
    fn update_mod_func_applies_new_value() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 1);

        let applied = cache
            .update_mod_func::<()>(&key("a"), 2, |old| {
                let mut next = old.cloned().unwrap();
                next.count += 1;
                Modify::Apply(next)
            })
            .unwrap();

        assert!(applied);
        assert_eq!(cache.get(&key("a")).unwrap().count, 2);
    }

    #[test]
    fn update_mod_func_sees_absent_key_as_none() {
        let cache = ObjectCache::new();
        let applied = cache
            .update_mod_func::<()>(&key("new"), 1, |old| {
                assert!(old.is_none());
                Modify::Apply(obj("new", 1))
            })
            .unwrap();
        assert!(applied);
        assert!(cache.has_key(&key("new")));
    }

    #[test]
    fn update_mod_func_unchanged_and_reject_leave_state() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 1);
        let log = record_events(&cache);

        let unchanged = cache.update_mod_func::<String>(&key("a"), 2, |_| Modify::Unchanged);
        assert_eq!(unchanged, Ok(false));

        let rejected =
            cache.update_mod_func(&key("a"), 3, |_| Modify::<TestObj, _>::Reject("nope"));
        assert_eq!(rejected, Err("nope"));

        assert_eq!(cache.get_with_rev(&key("a")).unwrap().1, 1);
        assert!(log.lock().unwrap().is_empty());
    }

    // ── Deletes ────────────────────────────────────────────────────

    #[test]
    fn delete_notifies_and_reports_presence() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 1);
        let log = record_events(&cache);

        assert!(cache.delete(&obj("a", 0), 2));
        assert!(!cache.delete(&obj("a", 0), 3));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(*log.lock().unwrap(), vec!["notify:a", "deleted:a"]);
    }

    #[test]
    fn prune_removes_keys_outside_valid_set() {
        let cache = ObjectCache::new();
        for name in ["a", "b", "c"] {
            cache.update(obj(name, 1), 1);
        }
        let log = record_events(&cache);

        let valid: HashSet<TestKey> = [key("b")].into_iter().collect();
        assert_eq!(cache.prune(&valid), 2);

        let keys: Vec<_> = cache.get_all_keys().into_iter().map(|k| k.name).collect();
        assert_eq!(keys, vec!["b"]);
        let mut deleted: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("deleted:"))
            .cloned()
            .collect();
        deleted.sort();
        assert_eq!(deleted, vec!["deleted:a", "deleted:c"]);
    }

    // ── Show ───────────────────────────────────────────────────────

    #[test]
    fn show_filters_on_set_fields() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 1);
        cache.update(obj("b", 2), 1);
        cache.update(obj("c", 2), 1);

        let filter = TestObj {
            count: 2,
            ..Default::default()
        };
        let mut names = Vec::new();
        cache
            .show::<()>(Some(&filter), |o| {
                names.push(o.key.name.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(names, vec!["b", "c"]);

        let mut all = 0;
        cache
            .show::<()>(None, |_| {
                all += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(all, 3);
    }

    #[test]
    fn show_by_key_ignores_default_state() {
        use crate::objects::{Cloudlet, CloudletKey};
        use crate::state::TrackedState;

        let cloudlet = |name: &str, state| Cloudlet {
            key: CloudletKey {
                organization: "operator".to_string(),
                name: name.to_string(),
            },
            state,
            ..Default::default()
        };
        let cache = ObjectCache::new();
        cache.update(cloudlet("hamburg", TrackedState::Ready), 1);
        cache.update(cloudlet("berlin", TrackedState::Ready), 1);

        let filter = Cloudlet {
            key: CloudletKey {
                name: "hamburg".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut matched = Vec::new();
        cache
            .show::<()>(Some(&filter), |c| {
                matched.push(c.key.name.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(matched, vec!["hamburg"]);
    }

    #[test]
    fn show_stops_at_first_callback_error() {
        let cache = ObjectCache::new();
        for name in ["a", "b", "c"] {
            cache.update(obj(name, 1), 1);
        }

        let mut visited = Vec::new();
        let err = cache
            .show(None, |o| {
                visited.push(o.key.name.clone());
                if o.key.name == "b" {
                    return Err(format!("stop at {}", o.key.name));
                }
                Ok(())
            })
            .unwrap_err();

        assert_eq!(err, "stop at b");
        assert_eq!(visited, vec!["a", "b"]);
    }

    // ── Sync ───────────────────────────────────────────────────────

    #[test]
    fn mark_and_sweep_removes_unlisted_entries() {
        let cache = ObjectCache::new();
        for name in ["a", "b", "c"] {
            cache.update(obj(name, 1), 1);
        }
        let log = record_events(&cache);

        cache.sync_list_start();
        let a = obj("a", 2);
        let b = obj("b", 2);
        cache.sync_update(&db_key_for("a"), &encode(&a), 5, 5);
        cache.sync_update(&db_key_for("b"), &encode(&b), 5, 5);
        cache.sync_list_end();

        let keys: Vec<_> = cache.get_all_keys().into_iter().map(|k| k.name).collect();
        assert_eq!(keys, vec!["a", "b"]);
        let deletions: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("deleted:"))
            .cloned()
            .collect();
        assert_eq!(deletions, vec!["deleted:c"]);
    }

    #[test]
    fn sync_list_end_without_start_is_ignored() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 1);
        cache.sync_list_end();
        assert_eq!(cache.get_count(), 1);
    }

    #[test]
    fn sync_update_with_bad_value_keeps_last_good_value() {
        let cache = ObjectCache::<TestObj>::new();
        let good = obj("a", 1);
        cache.sync_update(&db_key_for("a"), &encode(&good), 1, 1);
        cache.sync_update(&db_key_for("a"), b"{not json", 2, 2);

        let (value, rev) = cache.get_with_rev(&key("a")).unwrap();
        assert_eq!(value, good);
        assert_eq!(rev, 1);
    }

    #[test]
    fn sync_delete_parses_store_key() {
        let cache = ObjectCache::new();
        cache.update(obj("a", 1), 1);
        cache.update(obj("b", 1), 1);

        cache.sync_delete(&db_key_for("a"), 2, 2);
        cache.sync_delete("TestObj/garbage", 3, 3);

        assert!(!cache.has_key(&key("a")));
        assert!(cache.has_key(&key("b")));
    }
}
