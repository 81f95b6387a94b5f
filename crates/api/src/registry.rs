//! In-process `FleetApi`: a map of cluster connections, each with its own
//! refresh task and cache manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use fleet_core::{
    CacheConfig, CachedObject, ConnectionInfo, FleetError, FleetResult, GroupFailure, LabelSelector,
    LifecycleState, ObjectKey, ResourceTypeDescriptor, SyncPhase,
};
use fleet_kubehub::{Connector, KubeConnector, TypeIndex};
use fleet_store::{CacheManager, CacheSnapshot};
use parking_lot::{Mutex, RwLock};
use tokio::sync::RwLock as AsyncRwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{refresh, ClusterStatus, FleetApi};

/// Mutable bookkeeping of one cluster, written by its refresh task.
#[derive(Debug)]
pub(crate) struct ConnState {
    /// `Registered`, `Discovering` or `Removed`; the rest is derived from cache health.
    pub phase: LifecycleState,
    pub initial_done: bool,
    /// Why the latest pass could not connect or fetch the group list.
    pub failure: Option<FleetError>,
    pub discovery_failures: Vec<GroupFailure>,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub(crate) struct ClusterConnection {
    pub id: String,
    pub info: ConnectionInfo,
    pub cancel: CancellationToken,
    pub state: RwLock<ConnState>,
    pub index: ArcSwapOption<TypeIndex>,
    pub manager: ArcSwapOption<CacheManager>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterConnection {
    fn new(id: &str, info: ConnectionInfo) -> Self {
        Self {
            id: id.to_string(),
            info,
            cancel: CancellationToken::new(),
            state: RwLock::new(ConnState {
                phase: LifecycleState::Registered,
                initial_done: false,
                failure: None,
                discovery_failures: Vec::new(),
                last_discovery_at: None,
                last_error: None,
            }),
            index: ArcSwapOption::empty(),
            manager: ArcSwapOption::empty(),
            task: Mutex::new(None),
        }
    }

    fn lifecycle(&self) -> LifecycleState {
        let st = self.state.read();
        if st.phase == LifecycleState::Removed {
            return LifecycleState::Removed;
        }
        if st.failure.is_some() {
            return LifecycleState::Degraded;
        }
        if !st.initial_done {
            return st.phase;
        }
        let health = self.manager.load_full().map(|m| m.health()).unwrap_or_default();
        if health.values().any(|h| h.phase == SyncPhase::Degraded) {
            LifecycleState::Degraded
        } else if health.values().all(|h| h.seeded && h.phase == SyncPhase::Syncing) {
            LifecycleState::Ready
        } else {
            LifecycleState::Syncing
        }
    }

    /// Before any index exists, reports the failure of the latest pass if
    /// there was one, else `DiscoveryPending`.
    fn resolve(&self, raw: &str) -> FleetResult<Arc<ResourceTypeDescriptor>> {
        let Some(index) = self.index.load_full() else {
            let st = self.state.read();
            return Err(match &st.failure {
                Some(e) => e.clone(),
                None => FleetError::DiscoveryPending(format!("cluster '{}' has not completed discovery", self.id)),
            });
        };
        index.resolve(raw).cloned()
    }

    /// Seeded snapshot of the cache for `rt`.
    fn snapshot(&self, rt: &ResourceTypeDescriptor) -> FleetResult<Arc<CacheSnapshot>> {
        let key = rt.key();
        let snap = self
            .manager
            .load_full()
            .and_then(|m| m.snapshot(&key))
            .filter(|s| s.seeded)
            .ok_or_else(|| FleetError::CacheNotReady(format!("{} on cluster '{}' is still syncing", key, self.id)))?;
        Ok(snap)
    }
}

/// Registry of clusters, addressed by id. Implements `FleetApi`.
pub struct ClusterRegistry {
    connector: Arc<dyn Connector>,
    cfg: CacheConfig,
    clusters: AsyncRwLock<HashMap<String, Arc<ClusterConnection>>>,
}

impl ClusterRegistry {
    pub fn new(connector: Arc<dyn Connector>, cfg: CacheConfig) -> Self {
        Self { connector, cfg, clusters: AsyncRwLock::new(HashMap::new()) }
    }

    /// Registry that reaches clusters through the kube client.
    pub fn kube(cfg: CacheConfig) -> Self {
        Self::new(Arc::new(KubeConnector::new()), cfg)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    async fn connection(&self, id: &str) -> FleetResult<Arc<ClusterConnection>> {
        self.clusters
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::ClusterUnknown(id.to_string()))
    }

    /// Resolve `raw` and wait until its cache has completed the first seed.
    ///
    /// `DiscoveryPending` and `CacheNotReady` are retried until `timeout`.
    /// Any other error, such as `ClusterUnreachable` before the first
    /// discovery, is returned at once.
    pub async fn wait_for_kind(&self, id: &str, raw: &str, timeout: Duration) -> FleetResult<ResourceTypeDescriptor> {
        let wait = async {
            loop {
                let conn = self.connection(id).await?;
                match conn.resolve(raw).and_then(|rt| conn.snapshot(&rt).map(|_| rt)) {
                    Ok(rt) => return Ok(rt.as_ref().clone()),
                    Err(e @ (FleetError::DiscoveryPending(_) | FleetError::CacheNotReady(_))) => {
                        debug!(cluster = %id, kind = %raw, reason = %e, "waiting for kind");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(FleetError::Timeout(format!("'{}' on cluster '{}' not synced after {:?}", raw, id, timeout))),
        }
    }

    /// Caches of `id` currently holding an open watch.
    pub async fn active_subscriptions(&self, id: &str) -> FleetResult<usize> {
        let conn = self.connection(id).await?;
        let n = conn.manager.load_full().map(|m| m.active_subscriptions()).unwrap_or(0);
        Ok(n)
    }

    /// Deregister every cluster.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.deregister_cluster(&id).await {
                warn!(cluster = %id, error = %e, "deregister during shutdown failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl FleetApi for ClusterRegistry {
    async fn register_cluster(&self, id: &str, info: ConnectionInfo) -> FleetResult<()> {
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(id) {
            return Err(FleetError::AlreadyExists(id.to_string()));
        }
        let conn = Arc::new(ClusterConnection::new(id, info));
        let task = tokio::spawn(refresh::run(conn.clone(), self.connector.clone(), self.cfg.clone()));
        *conn.task.lock() = Some(task);
        clusters.insert(id.to_string(), conn);
        metrics::gauge!("fleet_clusters", clusters.len() as f64);
        info!(cluster = %id, "api: cluster registered");
        Ok(())
    }

    async fn deregister_cluster(&self, id: &str) -> FleetResult<()> {
        let t0 = Instant::now();
        let conn = {
            let mut clusters = self.clusters.write().await;
            let conn = clusters.remove(id).ok_or_else(|| FleetError::ClusterUnknown(id.to_string()))?;
            metrics::gauge!("fleet_clusters", clusters.len() as f64);
            conn
        };
        conn.state.write().phase = LifecycleState::Removed;
        conn.cancel.cancel();
        let task = conn.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.cfg.teardown_timeout, task).await.is_err() {
                warn!(cluster = %id, "refresh task did not stop in time; aborting");
                abort.abort();
            }
        }
        if let Some(manager) = conn.manager.swap(None) {
            manager.teardown_all().await;
        }
        conn.index.store(None);
        info!(cluster = %id, took_ms = %t0.elapsed().as_millis(), "api: cluster deregistered");
        Ok(())
    }

    async fn resolve_kind(&self, id: &str, raw: &str) -> FleetResult<ResourceTypeDescriptor> {
        let conn = self.connection(id).await?;
        let rt = conn.resolve(raw)?;
        Ok(rt.as_ref().clone())
    }

    async fn list(
        &self,
        id: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> FleetResult<Vec<Arc<CachedObject>>> {
        let t0 = Instant::now();
        let selector = selector.map(LabelSelector::parse).transpose()?;
        let conn = self.connection(id).await?;
        let rt = conn.resolve(kind)?;
        let snap = conn.snapshot(&rt)?;
        // Cluster-scoped kinds have no namespace to filter on.
        let namespace = if rt.namespaced { namespace } else { None };
        let items = snap.list(namespace, selector.as_ref());
        debug!(
            cluster = %id,
            gvr = %rt.key(),
            ns = %namespace.unwrap_or("(all)"),
            items = items.len(),
            took_ms = %t0.elapsed().as_millis(),
            "api: list ok"
        );
        Ok(items)
    }

    async fn get(&self, id: &str, kind: &str, namespace: Option<&str>, name: &str) -> FleetResult<Arc<CachedObject>> {
        let conn = self.connection(id).await?;
        let rt = conn.resolve(kind)?;
        let snap = conn.snapshot(&rt)?;
        let namespace = if rt.namespaced { namespace } else { None };
        let key = ObjectKey::new(namespace, name);
        snap.get(&key)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("{} {} on cluster '{}'", rt.kind, key, id)))
    }

    async fn cluster_status(&self, id: &str) -> FleetResult<ClusterStatus> {
        let conn = self.connection(id).await?;
        let state = conn.lifecycle();
        let types = conn.manager.load_full().map(|m| m.health()).unwrap_or_default();
        let st = conn.state.read();
        Ok(ClusterStatus {
            id: conn.id.clone(),
            state,
            types,
            discovery_failures: st.discovery_failures.clone(),
            last_discovery_at: st.last_discovery_at,
            last_error: st.last_error.clone(),
        })
    }

    async fn clusters(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
