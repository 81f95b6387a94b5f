//! The seam between the cache and a remote API server.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{ConnectionInfo, FleetError, Listing, ResourceTypeDescriptor, VersionToken, WatchEvent};
use futures::stream::BoxStream;

/// Failures of a single remote call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    /// The resume token is older than the server's retained history (HTTP 410).
    #[error("resource version {0} is too old")]
    Gone(VersionToken),
    #[error("watch stream closed")]
    StreamClosed,
    #[error("timed out after {0} ms")]
    Timeout(u128),
    #[error("connect: {0}")]
    Connect(String),
    #[error("api: {0}")]
    Api(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl From<SourceError> for FleetError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Gone(_) | SourceError::StreamClosed => FleetError::Watch(e.to_string()),
            SourceError::Timeout(_) => FleetError::Timeout(e.to_string()),
            SourceError::Connect(_) => FleetError::ClusterUnreachable(e.to_string()),
            SourceError::Api(_) | SourceError::Decode(_) => FleetError::Internal(e.to_string()),
        }
    }
}

pub type EventStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// Discovery/list/watch protocol client for one cluster. Read-only.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Names of the served API groups; the core group is `""`.
    async fn api_groups(&self) -> Result<Vec<String>, SourceError>;

    /// Resource types of one group, preferred version only.
    async fn group_resources(&self, group: &str) -> Result<Vec<ResourceTypeDescriptor>, SourceError>;

    async fn list(&self, rt: &ResourceTypeDescriptor) -> Result<Listing, SourceError>;

    /// Change stream for `rt` starting after `from`.
    async fn watch(&self, rt: &ResourceTypeDescriptor, from: VersionToken) -> Result<EventStream, SourceError>;
}

/// Turns connection info into a live source.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cluster: &str, info: &ConnectionInfo) -> Result<Arc<dyn ClusterSource>, SourceError>;
}
