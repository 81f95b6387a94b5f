//! Discovery resolver: which resource types does a cluster serve right now.

use std::future::Future;
use std::time::{Duration, Instant};

use fleet_core::{GroupFailure, ResourceTypeDescriptor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::index::TypeIndex;
use crate::source::{ClusterSource, SourceError};

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discovered {
    pub descriptors: Vec<ResourceTypeDescriptor>,
    pub failures: Vec<GroupFailure>,
}

impl Discovered {
    /// Keep the last known types of groups that failed this pass, so a flaky
    /// group does not evict its caches.
    pub fn carry_forward(&mut self, previous: &TypeIndex) {
        if self.failures.is_empty() {
            return;
        }
        for d in previous.descriptors() {
            if self.failures.iter().any(|f| f.group == d.group) && !self.descriptors.contains(&d) {
                self.descriptors.push(d);
            }
        }
        sort_descriptors(&mut self.descriptors);
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

fn sort_descriptors(v: &mut [ResourceTypeDescriptor]) {
    v.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.plural.cmp(&b.plural)));
}

/// Run `fut` with a deadline; expiry is a retryable `SourceError::Timeout`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(SourceError::Timeout(deadline.as_millis())),
    }
}

/// Discover every served group independently, keeping each group's preferred version.
///
/// Fails only when the group list itself cannot be fetched. A failing group
/// is recorded in `failures` and skipped.
pub async fn discover(cluster: &str, source: &dyn ClusterSource, deadline: Duration) -> Result<Discovered, SourceError> {
    let t0 = Instant::now();
    let groups = with_deadline(deadline, source.api_groups()).await?;
    let results = futures::future::join_all(groups.iter().map(|g| async move {
        let res = with_deadline(deadline, source.group_resources(g)).await;
        (g.as_str(), res)
    }))
    .await;

    let mut out = Discovered::default();
    for (group, res) in results {
        match res {
            Ok(mut descriptors) => out.descriptors.append(&mut descriptors),
            Err(e) => {
                warn!(cluster = %cluster, group = %group, error = %e, "group discovery failed");
                metrics::counter!("fleet_discovery_failures_total", 1u64, "cluster" => cluster.to_string());
                out.failures.push(GroupFailure { group: group.to_string(), reason: e.to_string() });
            }
        }
    }
    sort_descriptors(&mut out.descriptors);
    info!(
        cluster = %cluster,
        groups = groups.len(),
        types = out.descriptors.len(),
        failed = out.failures.len(),
        took_ms = %t0.elapsed().as_millis(),
        "discovery done"
    );
    Ok(out)
}
