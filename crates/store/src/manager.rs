//! Per-cluster set of watch caches, reconciled against discovery results.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_core::{CacheConfig, ResourceTypeDescriptor, TypeHealth};
use fleet_kubehub::ClusterSource;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::CacheSnapshot;
use crate::watch_cache::WatchCache;

/// Canonical type keys touched by one `reconcile` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

pub struct CacheManager {
    cluster: String,
    source: Arc<dyn ClusterSource>,
    cfg: CacheConfig,
    cancel: CancellationToken,
    caches: RwLock<BTreeMap<String, WatchCache>>,
    closed: AtomicBool,
}

impl CacheManager {
    /// `cancel` is the cluster token; each cache runs under a child of it.
    pub fn new(cluster: &str, source: Arc<dyn ClusterSource>, cfg: CacheConfig, cancel: CancellationToken) -> Self {
        Self {
            cluster: cluster.to_string(),
            source,
            cfg,
            cancel,
            caches: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Arc<dyn ClusterSource> {
        &self.source
    }

    /// Start caches for new types and stop those whose type vanished.
    ///
    /// A type whose version changed counts as one stop plus one start, since
    /// the canonical key includes the version.
    pub async fn reconcile(&self, descriptors: &[ResourceTypeDescriptor]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let wanted: BTreeMap<String, &ResourceTypeDescriptor> = descriptors.iter().map(|d| (d.key(), d)).collect();
        let evicted: Vec<WatchCache> = {
            let mut caches = self.caches.write();
            // Checked under the lock so nothing is inserted after teardown drained the map.
            if self.is_closed() {
                return report;
            }
            let gone: Vec<String> = caches.keys().filter(|k| !wanted.contains_key(*k)).cloned().collect();
            let mut evicted = Vec::with_capacity(gone.len());
            for key in gone {
                if let Some(cache) = caches.remove(&key) {
                    evicted.push(cache);
                    report.stopped.push(key);
                }
            }
            for (key, d) in &wanted {
                if caches.contains_key(key) {
                    report.unchanged += 1;
                    continue;
                }
                let cache = WatchCache::spawn(
                    &self.cluster,
                    (*d).clone(),
                    self.source.clone(),
                    self.cfg.clone(),
                    self.cancel.child_token(),
                );
                caches.insert(key.clone(), cache);
                report.started.push(key.clone());
            }
            evicted
        };
        let deadline = self.cfg.teardown_timeout;
        futures::future::join_all(evicted.into_iter().map(|c| c.stop(deadline))).await;
        if report.is_noop() {
            debug!(cluster = %self.cluster, unchanged = report.unchanged, "reconcile: no changes");
        } else {
            info!(
                cluster = %self.cluster,
                started = report.started.len(),
                stopped = report.stopped.len(),
                unchanged = report.unchanged,
                "reconciled watch caches"
            );
        }
        report
    }

    /// Stop every cache and refuse further reconciles.
    pub async fn teardown_all(&self) {
        let drained: Vec<WatchCache> = {
            let mut caches = self.caches.write();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *caches).into_values().collect()
        };
        let n = drained.len();
        let deadline = self.cfg.teardown_timeout;
        futures::future::join_all(drained.into_iter().map(|c| c.stop(deadline))).await;
        info!(cluster = %self.cluster, caches = n, "watch caches torn down");
    }

    pub fn snapshot(&self, key: &str) -> Option<Arc<CacheSnapshot>> {
        self.caches.read().get(key).map(|c| c.snapshot())
    }

    pub fn health(&self) -> BTreeMap<String, TypeHealth> {
        self.caches.read().iter().map(|(k, c)| (k.clone(), c.health())).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Caches currently holding an open watch.
    pub fn active_subscriptions(&self) -> usize {
        self.caches.read().values().filter(|c| c.is_subscribed()).count()
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
