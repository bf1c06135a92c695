//! Version registry — the ordered list of schema versions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use warpgrid_state::{KvStore, Stm};

use crate::error::{UpgradeError, UpgradeResult};

/// Rewrites data from the previous schema version.
///
/// `store` is for reads and prefix scans of committed data; every write
/// must go through `stm`, so the whole step commits or aborts as one
/// transaction.
pub type UpgradeFn = Arc<dyn Fn(&dyn KvStore, &mut dyn Stm) -> UpgradeResult<()> + Send + Sync>;

#[derive(Clone)]
pub struct UpgradeStep {
    pub name: String,
    pub func: UpgradeFn,
}

impl fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeStep").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct SchemaVersion {
    pub hash: String,
    /// Migrates data from the previous version to this one.
    pub upgrade: Option<UpgradeStep>,
}

/// Known schema versions, oldest first. A version's position is its
/// ordinal.
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    versions: Vec<SchemaVersion>,
}

impl VersionRegistry {
    pub fn builder() -> VersionRegistryBuilder {
        VersionRegistryBuilder::default()
    }

    pub fn ordinal(&self, hash: &str) -> Option<usize> {
        self.versions.iter().position(|v| v.hash == hash)
    }

    pub fn get(&self, ordinal: usize) -> Option<&SchemaVersion> {
        self.versions.get(ordinal)
    }

    pub fn latest(&self) -> &SchemaVersion {
        // The builder rejects empty registries.
        &self.versions[self.versions.len() - 1]
    }

    pub fn versions(&self) -> &[SchemaVersion] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[derive(Default)]
pub struct VersionRegistryBuilder {
    versions: Vec<SchemaVersion>,
}

impl VersionRegistryBuilder {
    /// A version that needs no data migration.
    pub fn version(mut self, hash: impl Into<String>) -> Self {
        self.versions.push(SchemaVersion {
            hash: hash.into(),
            upgrade: None,
        });
        self
    }

    /// A version whose data is produced from the previous one by `func`.
    pub fn upgrade(
        mut self,
        hash: impl Into<String>,
        name: impl Into<String>,
        func: impl Fn(&dyn KvStore, &mut dyn Stm) -> UpgradeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.versions.push(SchemaVersion {
            hash: hash.into(),
            upgrade: Some(UpgradeStep {
                name: name.into(),
                func: Arc::new(func),
            }),
        });
        self
    }

    pub fn build(self) -> UpgradeResult<VersionRegistry> {
        if self.versions.is_empty() {
            return Err(UpgradeError::Registry("no versions".to_string()));
        }
        let mut seen = HashSet::new();
        for version in &self.versions {
            if version.hash.is_empty() {
                return Err(UpgradeError::Registry("empty version hash".to_string()));
            }
            if !seen.insert(version.hash.as_str()) {
                return Err(UpgradeError::Registry(format!(
                    "duplicate version hash {}",
                    version.hash
                )));
            }
        }
        Ok(VersionRegistry {
            versions: self.versions,
        })
    }
}

/// Version hash of a schema layout descriptor: the first 32 hex digits of
/// its SHA-256.
pub fn schema_hash(descriptor: &str) -> String {
    let mut hash = hex::encode(Sha256::digest(descriptor.as_bytes()));
    hash.truncate(32);
    hash
}
