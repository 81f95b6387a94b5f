//! Fleet public API façade (in-process).
//!
//! `FleetApi` is the surface frontends depend on; `ClusterRegistry` is the
//! in-process implementation that owns every registered cluster.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fleet_core::{
    CacheConfig, CachedObject, ConnectionInfo, FleetError, FleetResult, GroupFailure, LifecycleState,
    ResourceTypeDescriptor, SyncPhase, TypeHealth,
};
pub use registry::ClusterRegistry;

mod refresh;
mod registry;

/// Point-in-time view of one registered cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterStatus {
    pub id: String,
    pub state: LifecycleState,
    /// Health per canonical type key (`v1/pods`, `apps/v1/deployments`).
    pub types: BTreeMap<String, TypeHealth>,
    /// Groups that failed during the latest discovery pass.
    pub discovery_failures: Vec<GroupFailure>,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ClusterStatus {
    pub fn objects(&self) -> usize {
        self.types.values().map(|h| h.objects).sum()
    }
}

/// Multi-cluster read API.
#[async_trait::async_trait]
pub trait FleetApi: Send + Sync {
    /// Start tracking a cluster. Returns immediately; discovery and seeding
    /// run in the background. `AlreadyExists` if the id is taken.
    async fn register_cluster(&self, id: &str, info: ConnectionInfo) -> FleetResult<()>;

    /// Stop every task of the cluster and forget it. `ClusterUnknown` if absent.
    async fn deregister_cluster(&self, id: &str) -> FleetResult<()>;

    /// Map a user-supplied kind spelling (`pod`, `Pods`, `deployments.apps`) to its type.
    async fn resolve_kind(&self, id: &str, raw: &str) -> FleetResult<ResourceTypeDescriptor>;

    /// Cached objects of `kind`, optionally narrowed to a namespace and a label selector.
    async fn list(
        &self,
        id: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> FleetResult<Vec<Arc<CachedObject>>>;

    async fn get(&self, id: &str, kind: &str, namespace: Option<&str>, name: &str) -> FleetResult<Arc<CachedObject>>;

    async fn cluster_status(&self, id: &str) -> FleetResult<ClusterStatus>;

    /// Registered cluster ids, sorted.
    async fn clusters(&self) -> Vec<String>;
}
