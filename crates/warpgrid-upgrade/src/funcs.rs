//! Built-in upgrade functions and the controller's version registry.
//!
//! Upgrade functions work on the persisted JSON. Old layouts are described
//! by structs local to the function that needs them; they exist only to
//! decode data written before the layout changed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use warpgrid_cache::{
    APP_INST, AppInst, AppInstKey, AppKey, CLOUDLET, CloudletKey, ClusterInstKey,
    DEFAULT_RESOURCE_ALERT_THRESHOLD, FlavorKey, TrackedState, object_db_key,
};
use warpgrid_state::{KvStore, Stm, db_key_prefix};

use crate::error::{UpgradeError, UpgradeResult};
use crate::registry::{VersionRegistry, schema_hash};

/// Name of the cloudlet field filled in by [`add_cloudlet_alert_threshold`].
const ALERT_THRESHOLD_FIELD: &str = "default_resource_alert_threshold";

fn scan(store: &dyn KvStore, typ: &str) -> UpgradeResult<Vec<(String, Vec<u8>)>> {
    let mut entries = Vec::new();
    store.list(&db_key_prefix(typ), &mut |key, value, _| {
        entries.push((key.to_string(), value.to_vec()));
        Ok(())
    })?;
    Ok(entries)
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, value: &[u8]) -> UpgradeResult<T> {
    serde_json::from_slice(value).map_err(|e| UpgradeError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> UpgradeResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| UpgradeError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// App instances used to be keyed by app and cloudlet, with the cluster
/// instance as a plain field. Re-key them by app and cluster instance.
///
/// The old cloudlet key wins over the one inside the cluster instance
/// field, which older tooling sometimes left blank. Entries whose key
/// already carries a cluster instance are left alone.
pub fn add_cluster_inst_key_to_app_inst_key(
    store: &dyn KvStore,
    stm: &mut dyn Stm,
) -> UpgradeResult<()> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct AppInstKeyV0 {
        app_key: AppKey,
        cloudlet_key: CloudletKey,
    }

    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct AppInstV0 {
        key: AppInstKeyV0,
        cluster_inst_key: ClusterInstKey,
        uri: String,
        flavor: FlavorKey,
        state: TrackedState,
        errors: Vec<String>,
    }

    let mut count = 0;
    for (old_key, value) in scan(store, APP_INST)? {
        let raw: Value = decode(&old_key, &value)?;
        if raw.pointer("/key/cluster_inst_key").is_some_and(Value::is_object) {
            debug!(%old_key, "app instance already keyed by cluster instance");
            continue;
        }
        let v0: AppInstV0 = serde_json::from_value(raw).map_err(|e| UpgradeError::Decode {
            key: old_key.clone(),
            reason: e.to_string(),
        })?;

        let mut cluster_inst_key = v0.cluster_inst_key;
        if cluster_inst_key.cloudlet_key != v0.key.cloudlet_key {
            cluster_inst_key.cloudlet_key = v0.key.cloudlet_key;
        }
        let v1 = AppInst {
            key: AppInstKey {
                app_key: v0.key.app_key,
                cluster_inst_key,
            },
            flavor: v0.flavor,
            uri: v0.uri,
            state: v0.state,
            errors: v0.errors,
        };

        let new_key = object_db_key::<AppInst>(&v1.key).map_err(|e| UpgradeError::Encode {
            key: old_key.clone(),
            reason: e.to_string(),
        })?;
        let new_value = encode(&new_key, &v1)?;
        stm.delete(&old_key)?;
        stm.put(&new_key, &new_value)?;
        debug!(%old_key, %new_key, "re-keyed app instance");
        count += 1;
    }
    debug!(count, "app instance keys upgraded");
    Ok(())
}

/// Give every cloudlet without a resource alert threshold the default one.
///
/// A threshold of zero counts as unset and is replaced too, since a zero
/// threshold would alert on every resource. Works on the raw JSON object
/// so unknown fields survive untouched. Cloudlets that already have a
/// non-zero threshold are left alone, which makes the function safe to run
/// more than once.
pub fn add_cloudlet_alert_threshold(store: &dyn KvStore, stm: &mut dyn Stm) -> UpgradeResult<()> {
    let mut count = 0;
    for (key, value) in scan(store, CLOUDLET)? {
        let mut cloudlet: Map<String, Value> = decode(&key, &value)?;
        let has_threshold = cloudlet
            .get(ALERT_THRESHOLD_FIELD)
            .and_then(Value::as_u64)
            .is_some_and(|threshold| threshold != 0);
        if has_threshold {
            continue;
        }
        cloudlet.insert(
            ALERT_THRESHOLD_FIELD.to_string(),
            Value::from(DEFAULT_RESOURCE_ALERT_THRESHOLD),
        );
        stm.put(&key, &encode(&key, &cloudlet)?)?;
        count += 1;
    }
    debug!(count, "cloudlet alert thresholds set");
    Ok(())
}

/// Key and value layouts of each schema version, oldest first.
const SCHEMA_DESCRIPTORS: [&str; 4] = [
    "AppInst{key:{app_key,cloudlet_key},cluster_inst_key};Cloudlet{key}",
    "AppInst{key:{app_key,cluster_inst_key}};Cloudlet{key}",
    "AppInst{key:{app_key,cluster_inst_key}};Cloudlet{key,default_resource_alert_threshold}",
    "AppInst{key:{app_key,cluster_inst_key}};Cloudlet{key,default_resource_alert_threshold};ClusterInst{reservable,reserved_by}",
];

/// The controller's schema history.
pub fn default_registry() -> UpgradeResult<VersionRegistry> {
    let [v0, v1, v2, v3] = SCHEMA_DESCRIPTORS.map(schema_hash);
    VersionRegistry::builder()
        .version(v0)
        .upgrade(v1, "AddClusterInstKeyToAppInstKey", add_cluster_inst_key_to_app_inst_key)
        .upgrade(v2, "CloudletResourceAlertThreshold", add_cloudlet_alert_threshold)
        // Reservation fields default to free and non-reservable.
        .version(v3)
        .build()
}
