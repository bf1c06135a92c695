//! warpgrid-upgrade — schema migrations for the controller's store.
//!
//! Every change to the persisted key or value layout gets a new schema
//! version, identified by a hash of the layout. Versions are listed in a
//! [`VersionRegistry`] in the order they were introduced; a version may
//! carry an upgrade function that rewrites data written under the previous
//! version. The store records the version it was last upgraded to under
//! the reserved `Version` key.
//!
//! # Architecture
//!
//! ```text
//! check_version ──UpgradeRequired──▶ upgrade_to_latest
//!                                        │ for each later version:
//!                                        ├─ run_single_upgrade (one STM txn)
//!                                        └─ write version marker (own txn)
//! ```
//!
//! Each step commits on its own, so a failure leaves the store at the last
//! version that completed and a restart resumes from there.

pub mod engine;
pub mod error;
pub mod funcs;
pub mod registry;

pub use engine::{VersionCheck, check_version, read_version, run_single_upgrade, upgrade_to_latest};
pub use error::{UpgradeError, UpgradeResult};
pub use funcs::{add_cloudlet_alert_threshold, add_cluster_inst_key_to_app_inst_key, default_registry};
pub use registry::{
    SchemaVersion, UpgradeFn, UpgradeStep, VersionRegistry, VersionRegistryBuilder, schema_hash,
};
