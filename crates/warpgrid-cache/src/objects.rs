//! Controller object types.
//!
//! Keys nest the way the objects reference each other: a cluster instance
//! is identified by its cluster, the cloudlet it runs on, and the owning
//! organization; an app instance by its app and the cluster instance it is
//! deployed to. All fields default so older stored values still decode.

use serde::{Deserialize, Serialize};

use crate::object::CacheObject;
use crate::state::{StatusInfo, TrackedState};

pub const FLAVOR: &str = "Flavor";
pub const CLOUDLET: &str = "Cloudlet";
pub const CLOUDLET_INFO: &str = "CloudletInfo";
pub const CLUSTER_INST: &str = "ClusterInst";
pub const CLUSTER_INST_INFO: &str = "ClusterInstInfo";
pub const APP: &str = "App";
pub const APP_INST: &str = "AppInst";
pub const APP_INST_INFO: &str = "AppInstInfo";

/// Alert threshold applied to cloudlets that never configured one.
pub const DEFAULT_RESOURCE_ALERT_THRESHOLD: u32 = 80;

macro_rules! cache_object {
    ($ty:ty, $key:ty, $name:expr) => {
        impl CacheObject for $ty {
            type Key = $key;
            const TYPE_NAME: &'static str = $name;

            fn key(&self) -> &$key {
                &self.key
            }
        }
    };
}

// ── Keys ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlavorKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudletKey {
    pub organization: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInstKey {
    pub cluster_key: ClusterKey,
    pub cloudlet_key: CloudletKey,
    pub organization: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppKey {
    pub organization: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInstKey {
    pub app_key: AppKey,
    pub cluster_inst_key: ClusterInstKey,
}

// ── Objects ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Flavor {
    pub key: FlavorKey,
    pub ram_mb: u64,
    pub vcpus: u64,
    pub disk_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Cloudlet {
    pub key: CloudletKey,
    pub location: String,
    pub platform_type: String,
    pub num_dynamic_ips: u32,
    /// Percentage of a resource quota at which an alert is raised.
    pub default_resource_alert_threshold: u32,
    pub state: TrackedState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInst {
    pub key: ClusterInstKey,
    pub flavor: FlavorKey,
    pub num_nodes: u32,
    pub deployment: String,
    /// Created by the platform and handed out to tenants on demand.
    pub reservable: bool,
    /// Organization currently holding a reservable cluster, empty if free.
    pub reserved_by: String,
    pub state: TrackedState,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    pub key: AppKey,
    pub image_path: String,
    pub deployment: String,
    pub default_flavor: FlavorKey,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInst {
    pub key: AppInstKey,
    pub flavor: FlavorKey,
    pub uri: String,
    pub state: TrackedState,
    pub errors: Vec<String>,
}

// ── Info objects (reported by the cloudlet agent) ─────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudletInfo {
    pub key: CloudletKey,
    pub state: TrackedState,
    pub errors: Vec<String>,
    pub status: StatusInfo,
    pub notify_id: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInstInfo {
    pub key: ClusterInstKey,
    pub state: TrackedState,
    pub errors: Vec<String>,
    pub status: StatusInfo,
    pub notify_id: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInstInfo {
    pub key: AppInstKey,
    pub state: TrackedState,
    pub errors: Vec<String>,
    pub status: StatusInfo,
    pub notify_id: i64,
}

cache_object!(Flavor, FlavorKey, FLAVOR);
cache_object!(Cloudlet, CloudletKey, CLOUDLET);
cache_object!(CloudletInfo, CloudletKey, CLOUDLET_INFO);
cache_object!(ClusterInst, ClusterInstKey, CLUSTER_INST);
cache_object!(ClusterInstInfo, ClusterInstKey, CLUSTER_INST_INFO);
cache_object!(App, AppKey, APP);
cache_object!(AppInst, AppInstKey, APP_INST);
cache_object!(AppInstInfo, AppInstKey, APP_INST_INFO);
