//! Per-cluster refresh loop: connect, rediscover, reconcile caches.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fleet_core::{CacheConfig, FleetError, LifecycleState};
use fleet_kubehub::{discover, with_deadline, Connector, SourceError, TypeIndex};
use fleet_store::CacheManager;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::registry::ClusterConnection;

/// Runs until the cluster token is cancelled. The first tick fires at once
/// and is the cluster's initial pass.
pub(crate) async fn run(conn: Arc<ClusterConnection>, connector: Arc<dyn Connector>, cfg: CacheConfig) {
    let mut tick = tokio::time::interval(cfg.refresh_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            _ = refresh_once(&conn, connector.as_ref(), &cfg) => {}
        }
    }
    info!(cluster = %conn.id, "refresh loop stopped");
}

async fn refresh_once(conn: &ClusterConnection, connector: &dyn Connector, cfg: &CacheConfig) {
    let t0 = Instant::now();
    let manager = match conn.manager.load_full() {
        Some(m) => m,
        None => {
            {
                let mut st = conn.state.write();
                if !st.initial_done {
                    st.phase = LifecycleState::Discovering;
                }
            }
            match with_deadline(cfg.request_timeout, connector.connect(&conn.id, &conn.info)).await {
                Ok(source) => {
                    let m = Arc::new(CacheManager::new(&conn.id, source, cfg.clone(), conn.cancel.clone()));
                    conn.manager.store(Some(m.clone()));
                    info!(cluster = %conn.id, took_ms = %t0.elapsed().as_millis(), "connected");
                    m
                }
                Err(e) => {
                    warn!(cluster = %conn.id, error = %e, "connect failed; retrying next tick");
                    record_failure(conn, pass_error(e));
                    return;
                }
            }
        }
    };

    let mut found = match discover(&conn.id, &**manager.source(), cfg.request_timeout).await {
        Ok(d) => d,
        Err(e) => {
            warn!(cluster = %conn.id, error = %e, "discovery failed; keeping previous types");
            metrics::counter!("fleet_discovery_failures_total", 1u64, "cluster" => conn.id.clone());
            record_failure(conn, pass_error(e));
            return;
        }
    };
    if let Some(previous) = conn.index.load_full() {
        found.carry_forward(&previous);
    }
    conn.index.store(Some(Arc::new(TypeIndex::build(&found.descriptors))));
    {
        let mut st = conn.state.write();
        st.failure = None;
        st.last_discovery_at = Some(Utc::now());
        st.last_error = if found.is_partial() {
            let groups: Vec<&str> = found.failures.iter().map(|f| f.group.as_str()).collect();
            Some(FleetError::Discovery(format!("groups failed: {}", groups.join(", "))).to_string())
        } else {
            None
        };
        st.discovery_failures = found.failures;
    }

    let report = manager.reconcile(&found.descriptors).await;
    let first = {
        let mut st = conn.state.write();
        let first = !st.initial_done;
        st.initial_done = true;
        first
    };
    if first {
        info!(
            cluster = %conn.id,
            types = found.descriptors.len(),
            started = report.started.len(),
            took_ms = %t0.elapsed().as_millis(),
            "initial pass done"
        );
    }
}

/// A failed connect or group listing. Timeouts count as unreachable too.
fn pass_error(e: SourceError) -> FleetError {
    match e {
        SourceError::Timeout(_) => FleetError::ClusterUnreachable(e.to_string()),
        e => match FleetError::from(e) {
            FleetError::Internal(msg) => FleetError::Discovery(msg),
            other => other,
        },
    }
}

fn record_failure(conn: &ClusterConnection, err: FleetError) {
    let mut st = conn.state.write();
    st.last_error = Some(err.to_string());
    st.failure = Some(err);
}
