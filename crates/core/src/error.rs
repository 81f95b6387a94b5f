//! Error taxonomy surfaced to callers of the cache.

use serde::{Deserialize, Serialize};

/// Errors suitable for transport to the router layer.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FleetError {
    /// Some API groups could not be discovered; the rest were.
    #[error("discovery: {0}")]
    Discovery(String),
    /// Subscription broke or its resume token expired.
    #[error("watch: {0}")]
    Watch(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("cluster unknown: {0}")]
    ClusterUnknown(String),
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),
    #[error("cluster already registered: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The first discovery pass for the cluster has not completed yet.
    #[error("discovery pending: {0}")]
    DiscoveryPending(String),
    /// The type is known but its cache has not finished the first listing.
    #[error("cache not ready: {0}")]
    CacheNotReady(String),
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether retrying the same call later can succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Discovery(_)
                | FleetError::Watch(_)
                | FleetError::ClusterUnreachable(_)
                | FleetError::DiscoveryPending(_)
                | FleetError::CacheNotReady(_)
                | FleetError::Timeout(_)
        )
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!FleetError::UnknownKind("x".into()).is_retryable());
        assert!(!FleetError::ClusterUnknown("c".into()).is_retryable());
        assert!(!FleetError::InvalidSelector("=".into()).is_retryable());
        assert!(FleetError::DiscoveryPending("c".into()).is_retryable());
        assert!(FleetError::CacheNotReady("v1/pods".into()).is_retryable());
    }
}
