//! Fleet core types shared by discovery, the watch caches and the registry.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;
pub mod selector;

pub use config::CacheConfig;
pub use error::{FleetError, FleetResult};
pub use selector::LabelSelector;

/// Opaque, monotonically increasing revision marker of a remote object.
///
/// Kubernetes hands these out as decimal strings (`metadata.resourceVersion`);
/// the cache only ever compares them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionToken(pub u64);

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VersionToken {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(VersionToken)
    }
}

/// A served resource type as produced by one discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceTypeDescriptor {
    pub group: String,
    pub version: String,
    /// Plural resource name as used in URLs, e.g. `pods`.
    pub plural: String,
    /// Canonical kind, e.g. `Pod`.
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceTypeDescriptor {
    /// Canonical identity: `group/version/plural`, or `version/plural` for the core group.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Address of an object inside one watch cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Tagged record for any remote object, whatever its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedObject {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    pub token: VersionToken,
    /// Raw object (managed fields stripped).
    pub payload: serde_json::Value,
}

impl CachedObject {
    pub fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// One change notification from a subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WatchEvent {
    Added(CachedObject),
    Modified(CachedObject),
    Deleted(CachedObject),
    /// Progress marker; carries no object, only a newer resume point.
    Bookmark(VersionToken),
}

impl WatchEvent {
    pub fn token(&self) -> VersionToken {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.token,
            WatchEvent::Bookmark(t) => *t,
        }
    }
}

/// Result of a full listing: every object plus the collection token to resume from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Listing {
    pub items: Vec<CachedObject>,
    pub token: VersionToken,
}

/// Credentials/endpoint for one cluster. Opaque to the cache; handed to a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionInfo {
    /// Inline kubeconfig document, as issued by the credential subsystem.
    Kubeconfig { yaml: String, context: Option<String> },
    KubeconfigPath { path: String, context: Option<String> },
    InCluster,
    /// Environment kubeconfig, falling back to the in-cluster service account.
    Infer,
}

/// Lifecycle of a registered cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    Registered,
    Discovering,
    Syncing,
    Ready,
    Degraded,
    Removed,
}

/// Phase of a single watch cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Seeding,
    Syncing,
    Degraded,
    Stopped,
}

/// Sync health of one (cluster, type) cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TypeHealth {
    pub phase: SyncPhase,
    pub objects: usize,
    pub baseline: VersionToken,
    /// True once the first listing has been applied.
    pub seeded: bool,
    pub restarts: u64,
    pub stale_dropped: u64,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// An API group that could not be discovered during one pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupFailure {
    pub group: String,
    pub reason: String,
}

pub mod prelude {
    pub use super::{
        CachedObject, ConnectionInfo, GroupFailure, LifecycleState, Listing, ObjectKey, ResourceTypeDescriptor,
        SyncPhase, TypeHealth, VersionToken, WatchEvent,
    };
    pub use super::{CacheConfig, FleetError, FleetResult, LabelSelector};
}
