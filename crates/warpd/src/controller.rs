//! Controller assembly: store preparation, caches, and the sync loop.

use std::sync::Arc;

use anyhow::bail;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use warpgrid_cache::{
    App, AppInst, AppInstInfo, CacheSync, Cloudlet, CloudletInfo, ClusterInst, ClusterInstInfo,
    Flavor, FreeReservableIndex, NotifyOrder, ObjectCache, SyncStats, default_dependencies,
};
use warpgrid_state::{KvStore, StateStore, SyncEvent};
use warpgrid_upgrade::{VersionCheck, VersionRegistry, check_version, upgrade_to_latest};

use crate::config::ControllerConfig;

/// Bring the store to the latest schema version before anything reads it.
pub fn prepare_store(
    store: &dyn KvStore,
    registry: &VersionRegistry,
    config: &ControllerConfig,
) -> anyhow::Result<()> {
    if config.skip_version_check {
        warn!("schema version check skipped");
        return Ok(());
    }
    match check_version(store, registry)? {
        VersionCheck::Initialized | VersionCheck::Current => Ok(()),
        VersionCheck::UpgradeRequired(found) => {
            if !config.auto_upgrade {
                bail!(
                    "store is at schema version {found}, expected {}; run `warpd upgrade` first",
                    registry.latest().hash
                );
            }
            let to = upgrade_to_latest(store, registry, &found)?;
            info!(from = %found, %to, "store upgraded");
            Ok(())
        }
    }
}

/// One cache per object type.
#[derive(Clone, Default)]
pub struct Caches {
    pub flavors: Arc<ObjectCache<Flavor>>,
    pub cloudlets: Arc<ObjectCache<Cloudlet>>,
    pub cloudlet_infos: Arc<ObjectCache<CloudletInfo>>,
    pub cluster_insts: Arc<ObjectCache<ClusterInst>>,
    pub cluster_inst_infos: Arc<ObjectCache<ClusterInstInfo>>,
    pub apps: Arc<ObjectCache<App>>,
    pub app_insts: Arc<ObjectCache<AppInst>>,
    pub app_inst_infos: Arc<ObjectCache<AppInstInfo>>,
}

pub struct Controller {
    store: StateStore,
    sync: CacheSync,
    caches: Caches,
    free_clusters: Arc<FreeReservableIndex<ClusterInst>>,
}

impl Controller {
    pub fn new(store: StateStore) -> anyhow::Result<Self> {
        let order = NotifyOrder::new(&default_dependencies())?;
        debug!(order = ?order.send_order(), "notify order");

        let caches = Caches::default();
        let mut sync = CacheSync::new(order);
        sync.register(caches.flavors.clone());
        sync.register(caches.cloudlets.clone());
        sync.register(caches.cloudlet_infos.clone());
        sync.register(caches.cluster_insts.clone());
        sync.register(caches.cluster_inst_infos.clone());
        sync.register(caches.apps.clone());
        sync.register(caches.app_insts.clone());
        sync.register(caches.app_inst_infos.clone());

        let free_clusters = Arc::new(FreeReservableIndex::new());
        free_clusters.attach(&caches.cluster_insts);

        Ok(Self {
            store,
            sync,
            caches,
            free_clusters,
        })
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Load every cache from the store.
    pub fn bootstrap(&mut self) -> anyhow::Result<SyncStats> {
        let stats = self.sync.resync(&self.store)?;
        info!(
            entries = stats.entries,
            rev = stats.rev,
            free_cluster_hosts = self.free_clusters.host_count(),
            "caches loaded"
        );
        Ok(stats)
    }

    /// Apply the change feed until shutdown.
    ///
    /// `events` must be subscribed before [`bootstrap`](Self::bootstrap) so
    /// nothing committed in between is missed; replaying an event the
    /// listing already covered is harmless.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<SyncEvent>,
        mut shutdown: watch::Receiver<bool>,
        resync_on_lag: bool,
    ) -> anyhow::Result<()> {
        info!(rev = self.sync.rev(), "sync loop started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.sync.handle(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed lagged");
                        if resync_on_lag {
                            self.bootstrap()?;
                        } else {
                            bail!("change feed dropped {skipped} events");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("change feed closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        info!(rev = self.sync.rev(), "sync loop stopped");
        Ok(())
    }
}
