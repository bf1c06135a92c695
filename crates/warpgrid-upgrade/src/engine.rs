//! Upgrade engine — walks the store forward to the latest schema version.

use tracing::{debug, info, warn};
use warpgrid_state::{KvStore, Revision, StateError, VERSION_KEY};

use crate::error::{UpgradeError, UpgradeResult};
use crate::registry::{UpgradeStep, VersionRegistry};

/// Outcome of the startup version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// The store had no version marker; it was stamped with the latest.
    Initialized,
    Current,
    /// The store is at this older (or unknown) version.
    UpgradeRequired(String),
}

/// Run one upgrade function inside a single transaction.
///
/// Everything the function wrote commits together, or, if it fails,
/// nothing does. Returns the commit revision.
pub fn run_single_upgrade(store: &dyn KvStore, step: &UpgradeStep) -> UpgradeResult<Revision> {
    let mut failure: Option<UpgradeError> = None;
    let result = store.apply_stm(&mut |stm| match (step.func)(store, stm) {
        Ok(()) => Ok(()),
        Err(e) => {
            let reason = e.to_string();
            failure = Some(e);
            Err(StateError::Aborted(reason))
        }
    });

    match result {
        Ok(rev) => {
            debug!(upgrade = %step.name, rev, "upgrade step committed");
            Ok(rev)
        }
        Err(e) => Err(UpgradeError::StepFailed {
            name: step.name.clone(),
            source: Box::new(failure.unwrap_or(UpgradeError::State(e))),
        }),
    }
}

/// Apply every upgrade after `from`, in order, advancing the version
/// marker after each one. Returns the hash the store ends up at.
///
/// An unknown `from` is rejected before anything is written. On failure
/// the marker stays at the last version that completed.
pub fn upgrade_to_latest(
    store: &dyn KvStore,
    registry: &VersionRegistry,
    from: &str,
) -> UpgradeResult<String> {
    let Some(start) = registry.ordinal(from) else {
        return Err(UpgradeError::UnknownVersion(from.to_string()));
    };
    info!(from, to = %registry.latest().hash, "upgrading store");

    for version in &registry.versions()[start + 1..] {
        if let Some(step) = &version.upgrade {
            info!(upgrade = %step.name, version = %version.hash, "running upgrade");
            run_single_upgrade(store, step)?;
        }
        write_version(store, &version.hash)?;
    }
    Ok(registry.latest().hash.clone())
}

/// Current version marker, `None` if the store has never been stamped.
pub fn read_version(store: &dyn KvStore) -> UpgradeResult<Option<String>> {
    match store.get(VERSION_KEY) {
        Ok(entry) => {
            let version = String::from_utf8(entry.value).map_err(|e| UpgradeError::Decode {
                key: VERSION_KEY.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(version).filter(|v| !v.is_empty()))
        }
        Err(StateError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_version(store: &dyn KvStore, hash: &str) -> UpgradeResult<()> {
    store
        .apply_stm(&mut |stm| stm.put(VERSION_KEY, hash.as_bytes()))
        .map_err(|source| UpgradeError::VersionMarker {
            version: hash.to_string(),
            source,
        })?;
    debug!(version = hash, "version marker written");
    Ok(())
}

/// Compare the store's version marker with the latest registered version.
/// A store without a marker is new and is stamped with the latest version.
pub fn check_version(store: &dyn KvStore, registry: &VersionRegistry) -> UpgradeResult<VersionCheck> {
    let latest = &registry.latest().hash;
    match read_version(store)? {
        None => {
            write_version(store, latest)?;
            info!(version = %latest, "initialized store version");
            Ok(VersionCheck::Initialized)
        }
        Some(found) if &found == latest => Ok(VersionCheck::Current),
        Some(found) => {
            warn!(found = %found, latest = %latest, "store requires upgrade");
            Ok(VersionCheck::UpgradeRequired(found))
        }
    }
}
