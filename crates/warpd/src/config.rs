//! controller.toml configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default tracing filter when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_FILTER: &str = "info,warpd=debug,warpgrid=debug";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Directory holding the controller database.
    pub data_dir: PathBuf,
    /// Upgrade an out-of-date store at startup instead of refusing to run.
    pub auto_upgrade: bool,
    /// Start without comparing the store's schema version.
    pub skip_version_check: bool,
    pub log_filter: String,
    /// Rebuild caches from the store when the change feed drops events.
    pub resync_on_lag: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/warpgrid"),
            auto_upgrade: false,
            skip_version_check: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            resync_on_lag: true,
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("controller.redb")
    }
}
