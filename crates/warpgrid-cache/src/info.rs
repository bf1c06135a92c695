//! State tracking for info objects.
//!
//! Info objects carry the state an agent reports for work it executes on a
//! cloudlet: the tracked lifecycle state, accumulated error messages, and
//! progress of the current task. All mutations go through
//! [`ObjectCache::update_mod_func`], so each transition is checked and
//! applied atomically with respect to other writers of the same cache.

use std::convert::Infallible;

use tracing::{debug, warn};
use warpgrid_state::Revision;

use crate::cache::ObjectCache;
use crate::error::{CacheError, CacheResult};
use crate::object::{CacheObject, Modify};
use crate::objects::{AppInstInfo, CloudletInfo, ClusterInstInfo};
use crate::state::{StatusInfo, TrackedState, state_conflict};

/// Whether a status update starts from a cleared status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReset {
    Reset,
    Keep,
}

/// An object whose tracked state is reported by an agent.
pub trait InfoObject: CacheObject {
    fn new_for_key(key: &Self::Key) -> Self;
    fn state(&self) -> TrackedState;
    fn set_state_value(&mut self, state: TrackedState);
    fn errors_mut(&mut self) -> &mut Vec<String>;
    fn status(&self) -> &StatusInfo;
    fn status_mut(&mut self) -> &mut StatusInfo;
}

macro_rules! info_object {
    ($ty:ty) => {
        impl InfoObject for $ty {
            fn new_for_key(key: &Self::Key) -> Self {
                Self {
                    key: key.clone(),
                    ..Default::default()
                }
            }

            fn state(&self) -> TrackedState {
                self.state
            }

            fn set_state_value(&mut self, state: TrackedState) {
                self.state = state;
            }

            fn errors_mut(&mut self) -> &mut Vec<String> {
                &mut self.errors
            }

            fn status(&self) -> &StatusInfo {
                &self.status
            }

            fn status_mut(&mut self) -> &mut StatusInfo {
                &mut self.status
            }
        }
    };
}

info_object!(CloudletInfo);
info_object!(ClusterInstInfo);
info_object!(AppInstInfo);

// Local state updates are not committed to the store, so they carry no
// revision of their own.
const LOCAL_REV: Revision = 0;

impl<T: InfoObject> ObjectCache<T> {
    /// Move the object to `state`, creating it if absent.
    ///
    /// Errors and status are cleared. A transition between two different
    /// busy states is rejected and leaves the object untouched.
    pub fn set_state(&self, key: &T::Key, state: TrackedState) -> CacheResult<()> {
        let result = self.update_mod_func(key, LOCAL_REV, |old| {
            let mut info = match old {
                Some(old) => {
                    if let Err(e) = state_conflict(old.state(), state) {
                        return Modify::Reject(e);
                    }
                    old.clone()
                }
                None => T::new_for_key(key),
            };
            info.errors_mut().clear();
            info.set_state_value(state);
            info.status_mut().reset();
            Modify::Apply(info)
        });

        match result {
            Ok(_) => {
                debug!(typ = T::TYPE_NAME, ?key, %state, "set state");
                Ok(())
            }
            Err(e) => {
                warn!(typ = T::TYPE_NAME, ?key, error = %e, "state transition rejected");
                Err(e)
            }
        }
    }

    /// Start task `name`. Repeating the current task is a no-op.
    /// Returns whether the status changed.
    pub fn set_status_task(&self, key: &T::Key, name: &str, reset: StatusReset) -> bool {
        self.modify_status(key, |status| {
            if reset == StatusReset::Reset {
                status.reset();
            }
            status.set_task(name)
        })
    }

    pub fn set_status_step(&self, key: &T::Key, name: &str, reset: StatusReset) -> bool {
        self.modify_status(key, |status| {
            if reset == StatusReset::Reset {
                status.reset();
            }
            status.set_step(name);
            true
        })
    }

    pub fn set_status_max_tasks(&self, key: &T::Key, max: u32) -> bool {
        self.modify_status(key, |status| {
            status.set_max_tasks(max);
            true
        })
    }

    fn modify_status(&self, key: &T::Key, f: impl FnOnce(&mut StatusInfo) -> bool) -> bool {
        let result = self.update_mod_func::<Infallible>(key, LOCAL_REV, |old| {
            let Some(old) = old else {
                return Modify::Unchanged;
            };
            let mut info = old.clone();
            if f(info.status_mut()) {
                Modify::Apply(info)
            } else {
                Modify::Unchanged
            }
        });
        match result {
            Ok(changed) => {
                if !changed && !self.has_key(key) {
                    warn!(typ = T::TYPE_NAME, ?key, "status update for missing info object dropped");
                }
                changed
            }
            Err(never) => match never {},
        }
    }

    /// Record `msg` and force the object into `err_state`, creating the
    /// object if absent.
    pub fn set_error(&self, key: &T::Key, err_state: TrackedState, msg: &str) {
        let written = self.update_mod_func::<Infallible>(key, LOCAL_REV, |old| {
            let mut info = old.cloned().unwrap_or_else(|| T::new_for_key(key));
            info.errors_mut().push(msg.to_string());
            info.set_state_value(err_state);
            Modify::Apply(info)
        });
        match written {
            Ok(_) => warn!(typ = T::TYPE_NAME, ?key, state = %err_state, error = msg, "set error"),
            Err(never) => match never {},
        }
    }

    /// Seed an info object with `state` and `errors` if none exists yet.
    /// Returns whether one was created.
    pub fn refresh_obj(&self, key: &T::Key, state: TrackedState, errors: &[String]) -> bool {
        let created = self.update_mod_func::<Infallible>(key, LOCAL_REV, |old| {
            if old.is_some() {
                return Modify::Unchanged;
            }
            let mut info = T::new_for_key(key);
            info.set_state_value(state);
            info.errors_mut().extend_from_slice(errors);
            Modify::Apply(info)
        });
        match created {
            Ok(created) => created,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{AppInstKey, AppKey, CloudletKey};

    fn key() -> AppInstKey {
        AppInstKey {
            app_key: AppKey {
                organization: "dev".to_string(),
                name: "face-detect".to_string(),
                version: "1.0".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn set_state_creates_missing_info() {
        let cache = ObjectCache::<AppInstInfo>::new();
        cache.set_state(&key(), TrackedState::CreateRequested).unwrap();

        let info = cache.get(&key()).unwrap();
        assert_eq!(info.state, TrackedState::CreateRequested);
        assert_eq!(info.key, key());
    }

    #[test]
    fn set_state_clears_errors_and_status() {
        let cache = ObjectCache::<AppInstInfo>::new();
        cache.set_error(&key(), TrackedState::CreateError, "boom");
        cache.set_status_task(&key(), "Creating", StatusReset::Keep);

        cache.set_state(&key(), TrackedState::Creating).unwrap();
        let info = cache.get(&key()).unwrap();
        assert!(info.errors.is_empty());
        assert_eq!(info.status, StatusInfo::default());
    }

    #[test]
    fn busy_to_other_busy_is_rejected_without_mutation() {
        let cache = ObjectCache::<AppInstInfo>::new();
        cache.set_state(&key(), TrackedState::Creating).unwrap();
        cache.set_status_task(&key(), "Creating VMs", StatusReset::Keep);
        let before = cache.get(&key()).unwrap();

        let err = cache.set_state(&key(), TrackedState::Deleting).unwrap_err();
        assert!(matches!(
            err,
            CacheError::StateConflict {
                current: TrackedState::Creating,
                requested: TrackedState::Deleting
            }
        ));
        assert_eq!(cache.get(&key()).unwrap(), before);
    }

    #[test]
    fn status_updates_require_existing_info() {
        let cache = ObjectCache::<AppInstInfo>::new();
        assert!(!cache.set_status_task(&key(), "Creating", StatusReset::Keep));
        assert!(!cache.set_status_step(&key(), "Pulling image", StatusReset::Keep));
        assert!(!cache.set_status_max_tasks(&key(), 3));
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn status_task_progression() {
        let cache = ObjectCache::<AppInstInfo>::new();
        cache.set_state(&key(), TrackedState::Creating).unwrap();

        assert!(cache.set_status_max_tasks(&key(), 3));
        assert!(cache.set_status_task(&key(), "Creating VMs", StatusReset::Keep));
        assert!(cache.set_status_step(&key(), "Waiting for IP", StatusReset::Keep));
        assert!(!cache.set_status_task(&key(), "Creating VMs", StatusReset::Keep));

        let status = cache.get(&key()).unwrap().status;
        assert_eq!(status.render(), "Creating VMs(1 of 3), Waiting for IP");

        assert!(cache.set_status_task(&key(), "Configuring", StatusReset::Keep));
        let status = cache.get(&key()).unwrap().status;
        assert_eq!(status.render(), "Configuring(2 of 3)");
    }

    #[test]
    fn status_reset_restarts_numbering() {
        let cache = ObjectCache::<AppInstInfo>::new();
        cache.set_state(&key(), TrackedState::Updating).unwrap();
        cache.set_status_max_tasks(&key(), 4);
        cache.set_status_task(&key(), "Step A", StatusReset::Keep);
        cache.set_status_task(&key(), "Step B", StatusReset::Keep);

        cache.set_status_task(&key(), "Step C", StatusReset::Reset);
        let status = cache.get(&key()).unwrap().status;
        assert_eq!(status.task_number, 1);
        assert_eq!(status.max_tasks, 0);
        assert_eq!(status.render(), "Step C(1)");
    }

    #[test]
    fn set_error_appends_and_forces_state() {
        let cache = ObjectCache::<AppInstInfo>::new();
        cache.set_state(&key(), TrackedState::Creating).unwrap();
        cache.set_error(&key(), TrackedState::CreateError, "image pull failed");
        cache.set_error(&key(), TrackedState::CreateError, "retry failed");

        let info = cache.get(&key()).unwrap();
        assert_eq!(info.state, TrackedState::CreateError);
        assert_eq!(info.errors, vec!["image pull failed", "retry failed"]);
    }

    #[test]
    fn set_error_creates_missing_info_and_notifies() {
        let cache = ObjectCache::<AppInstInfo>::new();
        let notified = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = notified.clone();
        cache.add_notify_cb(move |k: &AppInstKey| sink.lock().unwrap().push(k.clone()));

        cache.set_error(&key(), TrackedState::DeleteError, "teardown failed");

        let info = cache.get(&key()).unwrap();
        assert_eq!(info.state, TrackedState::DeleteError);
        assert_eq!(info.errors, vec!["teardown failed"]);
        assert_eq!(*notified.lock().unwrap(), vec![key()]);
    }

    #[test]
    fn refresh_obj_only_seeds_missing() {
        let cache = ObjectCache::<CloudletInfo>::new();
        let key = CloudletKey {
            organization: "op".to_string(),
            name: "berlin".to_string(),
        };
        assert!(cache.refresh_obj(&key, TrackedState::Ready, &[]));
        assert!(!cache.refresh_obj(&key, TrackedState::CreateError, &["x".to_string()]));

        let info = cache.get(&key).unwrap();
        assert_eq!(info.state, TrackedState::Ready);
        assert!(info.errors.is_empty());
    }
}
