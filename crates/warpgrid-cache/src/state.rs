//! Tracked lifecycle state and progress status of remote operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Lifecycle state of an object as reported by the agent executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedState {
    #[default]
    Unknown,
    NotPresent,
    CreateRequested,
    Creating,
    CreateError,
    Ready,
    UpdateRequested,
    Updating,
    UpdateError,
    DeleteRequested,
    Deleting,
    DeleteError,
    DeletePrepare,
    InitOk,
    CreatingDependencies,
}

/// States in which an agent thread is actively working on the object.
pub const BUSY_STATES: [TrackedState; 3] = [
    TrackedState::Creating,
    TrackedState::Updating,
    TrackedState::Deleting,
];

impl TrackedState {
    pub fn is_busy(self) -> bool {
        BUSY_STATES.contains(&self)
    }

    /// Work is pending or in progress.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::CreateRequested
                | Self::Creating
                | Self::CreatingDependencies
                | Self::UpdateRequested
                | Self::Updating
                | Self::DeleteRequested
                | Self::Deleting
                | Self::DeletePrepare
        )
    }

    /// No work pending; the object rests here until the next request.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            Self::NotPresent
                | Self::Ready
                | Self::CreateError
                | Self::UpdateError
                | Self::DeleteError
        )
    }

    pub fn is_delete_state(self) -> bool {
        matches!(
            self,
            Self::DeleteRequested | Self::Deleting | Self::DeletePrepare
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::CreateError | Self::UpdateError | Self::DeleteError
        )
    }
}

impl fmt::Display for TrackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "TRACKED_STATE_UNKNOWN",
            Self::NotPresent => "NOT_PRESENT",
            Self::CreateRequested => "CREATE_REQUESTED",
            Self::Creating => "CREATING",
            Self::CreateError => "CREATE_ERROR",
            Self::Ready => "READY",
            Self::UpdateRequested => "UPDATE_REQUESTED",
            Self::Updating => "UPDATING",
            Self::UpdateError => "UPDATE_ERROR",
            Self::DeleteRequested => "DELETE_REQUESTED",
            Self::Deleting => "DELETING",
            Self::DeleteError => "DELETE_ERROR",
            Self::DeletePrepare => "DELETE_PREPARE",
            Self::InitOk => "INIT_OK",
            Self::CreatingDependencies => "CREATING_DEPENDENCIES",
        };
        f.write_str(name)
    }
}

/// Check whether moving from `current` to `requested` would clobber work
/// in flight.
///
/// An agent that reconnects resends its current state. If it only lost
/// the connection, the thread that was creating/updating/deleting may
/// still be running, and a second busy state must not replace it.
/// Re-reporting the same busy state is allowed.
pub fn state_conflict(current: TrackedState, requested: TrackedState) -> Result<(), CacheError> {
    if current.is_busy() && requested.is_busy() && current != requested {
        return Err(CacheError::StateConflict { current, requested });
    }
    Ok(())
}

/// Progress of the task currently executing for an object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusInfo {
    /// 1-based ordinal of the current task; 0 before the first task.
    pub task_number: u32,
    pub max_tasks: u32,
    pub task_name: String,
    pub step_name: String,
}

impl StatusInfo {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Start a new task. Repeating the current task name is a no-op.
    /// Returns whether anything changed.
    pub fn set_task(&mut self, name: &str) -> bool {
        if self.task_name == name {
            return false;
        }
        self.task_number += 1;
        self.task_name = name.to_string();
        self.step_name.clear();
        true
    }

    pub fn set_step(&mut self, name: &str) {
        self.step_name = name.to_string();
    }

    pub fn set_max_tasks(&mut self, max: u32) {
        self.max_tasks = max;
    }

    /// Human-readable progress, e.g. `"Creating VMs(2 of 5), Waiting for IP"`.
    pub fn render(&self) -> String {
        if self.task_name.is_empty() {
            return String::new();
        }
        let mut out = if self.max_tasks > 0 {
            format!(
                "{}({} of {})",
                self.task_name, self.task_number, self.max_tasks
            )
        } else {
            format!("{}({})", self.task_name, self.task_number)
        };
        if !self.step_name.is_empty() {
            out.push_str(", ");
            out.push_str(&self.step_name);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [TrackedState; 15] = [
        TrackedState::Unknown,
        TrackedState::NotPresent,
        TrackedState::CreateRequested,
        TrackedState::Creating,
        TrackedState::CreateError,
        TrackedState::Ready,
        TrackedState::UpdateRequested,
        TrackedState::Updating,
        TrackedState::UpdateError,
        TrackedState::DeleteRequested,
        TrackedState::Deleting,
        TrackedState::DeleteError,
        TrackedState::DeletePrepare,
        TrackedState::InitOk,
        TrackedState::CreatingDependencies,
    ];

    #[test]
    fn distinct_busy_states_conflict() {
        for current in BUSY_STATES {
            for requested in BUSY_STATES {
                let result = state_conflict(current, requested);
                if current == requested {
                    assert!(result.is_ok(), "{current} -> {requested}");
                } else {
                    assert!(result.is_err(), "{current} -> {requested}");
                }
            }
        }
    }

    #[test]
    fn leaving_a_busy_state_never_conflicts() {
        for current in BUSY_STATES {
            for requested in ALL_STATES.into_iter().filter(|s| !s.is_busy()) {
                assert!(state_conflict(current, requested).is_ok());
                assert!(state_conflict(requested, current).is_ok());
            }
        }
    }

    #[test]
    fn stable_and_transient_partition_work_states() {
        for state in ALL_STATES {
            assert!(
                !(state.is_stable() && state.is_transient()),
                "{state} is both stable and transient"
            );
        }
        for state in BUSY_STATES {
            assert!(state.is_transient());
        }
        assert!(TrackedState::Ready.is_stable());
        assert!(TrackedState::DeleteError.is_stable());
        assert!(TrackedState::DeletePrepare.is_delete_state());
    }

    #[test]
    fn conflict_error_names_current_state() {
        let err = state_conflict(TrackedState::Creating, TrackedState::Deleting).unwrap_err();
        assert_eq!(
            err.to_string(),
            "conflicting state: CREATING (requested DELETING)"
        );
    }

    #[test]
    fn set_task_advances_ordinal_and_clears_step() {
        let mut status = StatusInfo::default();
        assert!(status.set_task("Creating VMs"));
        status.set_step("Waiting for IP");
        assert!(!status.set_task("Creating VMs"));
        assert_eq!(status.step_name, "Waiting for IP");

        assert!(status.set_task("Configuring"));
        assert_eq!(status.task_number, 2);
        assert_eq!(status.step_name, "");
    }

    #[test]
    fn render_progress() {
        let mut status = StatusInfo::default();
        assert_eq!(status.render(), "");

        status.set_max_tasks(5);
        status.set_task("Creating VMs");
        assert_eq!(status.render(), "Creating VMs(1 of 5)");

        status.set_step("Waiting for IP");
        assert_eq!(status.render(), "Creating VMs(1 of 5), Waiting for IP");

        status.reset();
        status.set_task("Cleanup");
        assert_eq!(status.render(), "Cleanup(1)");
    }
}
