//! One list+watch task per (cluster, resource type).
//!
//! Phases: `Seeding -> Syncing -> Degraded -> Seeding ... -> Stopped`. The
//! task is the only writer; readers load the current `CacheSnapshot` through
//! an `ArcSwap` and never block it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use fleet_core::{CacheConfig, FleetError, ResourceTypeDescriptor, SyncPhase, TypeHealth, WatchEvent};
use fleet_kubehub::{with_deadline, ClusterSource, EventStream, SourceError};
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::{ApplyOutcome, CacheSnapshot, CacheState};

/// Upper bound of events coalesced into one snapshot swap.
const MAX_BATCH: usize = 256;

/// Handle to a running watch cache. Dropping it cancels the task.
pub struct WatchCache {
    descriptor: Arc<ResourceTypeDescriptor>,
    snap: Arc<ArcSwap<CacheSnapshot>>,
    health: Arc<watch::Sender<TypeHealth>>,
    health_rx: watch::Receiver<TypeHealth>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatchCache {
    /// Start the seed-and-stream loop. `cancel` should be a child of the cluster token.
    pub fn spawn(
        cluster: &str,
        descriptor: ResourceTypeDescriptor,
        source: Arc<dyn ClusterSource>,
        cfg: CacheConfig,
        cancel: CancellationToken,
    ) -> Self {
        let descriptor = Arc::new(descriptor);
        let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
        let (health_tx, health_rx) = watch::channel(TypeHealth::default());
        let health = Arc::new(health_tx);
        let worker = Worker {
            cluster: cluster.to_string(),
            gvr: descriptor.key(),
            descriptor: descriptor.clone(),
            source,
            cfg,
            state: CacheState::new(),
            snap: snap.clone(),
            health: health.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        Self { descriptor, snap, health, health_rx, cancel, task: Some(task) }
    }

    pub fn descriptor(&self) -> &Arc<ResourceTypeDescriptor> {
        &self.descriptor
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snap.load_full()
    }

    pub fn health(&self) -> TypeHealth {
        self.health_rx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<TypeHealth> {
        self.health_rx.clone()
    }

    /// True while the task holds an open subscription.
    pub fn is_subscribed(&self) -> bool {
        self.health_rx.borrow().phase == SyncPhase::Syncing
    }

    /// Cancel and wait for the task to exit, aborting it after `deadline`.
    ///
    /// On return the snapshot is empty and health reports `Stopped`, whether
    /// the task exited on its own or was aborted.
    pub async fn stop(mut self, deadline: Duration) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                warn!(gvr = %self.descriptor.key(), "watch task did not stop in time; aborting");
                task.abort();
                // Resolves once the task future has been dropped.
                let _ = task.await;
            }
        }
        // An aborted task never reaches its own cleanup.
        self.snap.store(Arc::new(CacheSnapshot::default()));
        mark_stopped(&self.health);
    }
}

impl Drop for WatchCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn mark_stopped(health: &watch::Sender<TypeHealth>) {
    health.send_modify(|h| {
        h.phase = SyncPhase::Stopped;
        h.objects = 0;
        h.seeded = false;
    });
}

/// Counts one open watch in `fleet_active_watches` for as long as it lives,
/// including when the task holding it is aborted.
struct ActiveWatch {
    cluster: String,
}

impl ActiveWatch {
    fn open(cluster: &str) -> Self {
        metrics::increment_gauge!("fleet_active_watches", 1.0, "cluster" => cluster.to_string());
        Self { cluster: cluster.to_string() }
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        metrics::decrement_gauge!("fleet_active_watches", 1.0, "cluster" => self.cluster.clone());
    }
}

struct Worker {
    cluster: String,
    gvr: String,
    descriptor: Arc<ResourceTypeDescriptor>,
    source: Arc<dyn ClusterSource>,
    cfg: CacheConfig,
    state: CacheState,
    snap: Arc<ArcSwap<CacheSnapshot>>,
    health: Arc<watch::Sender<TypeHealth>>,
    cancel: CancellationToken,
}

/// How a sync round ended.
enum RoundEnd {
    Cancelled,
    Failed(SourceError),
}

impl Worker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            match self.sync_round(&mut attempt).await {
                RoundEnd::Cancelled => break,
                RoundEnd::Failed(e) => {
                    let delay = self.cfg.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        cluster = %self.cluster,
                        gvr = %self.gvr,
                        error = %e,
                        retry_in_ms = %delay.as_millis(),
                        "watch degraded; will reseed"
                    );
                    metrics::counter!("fleet_watch_reseeds_total", 1u64, "cluster" => self.cluster.clone());
                    self.health.send_modify(|h| {
                        h.phase = SyncPhase::Degraded;
                        h.restarts += 1;
                        h.last_error = Some(FleetError::from(e.clone()).to_string());
                    });
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.snap.store(Arc::new(CacheSnapshot::default()));
        mark_stopped(&self.health);
        info!(cluster = %self.cluster, gvr = %self.gvr, "watch cache stopped");
    }

    /// Seed from a full listing, then stream until the subscription breaks.
    async fn sync_round(&mut self, attempt: &mut u32) -> RoundEnd {
        self.health.send_modify(|h| h.phase = SyncPhase::Seeding);
        let t0 = Instant::now();
        let listing = tokio::select! {
            _ = self.cancel.cancelled() => return RoundEnd::Cancelled,
            res = with_deadline(self.cfg.request_timeout, self.source.list(&self.descriptor)) => match res {
                Ok(l) => l,
                Err(e) => return RoundEnd::Failed(e),
            },
        };
        let items = listing.items.len();
        self.state.reseed(listing);
        self.publish();
        self.health.send_modify(|h| {
            h.seeded = true;
            h.objects = self.state.len();
            h.baseline = self.state.baseline();
            h.last_synced_at = Some(Utc::now());
        });
        info!(
            cluster = %self.cluster,
            gvr = %self.gvr,
            items,
            token = %self.state.baseline(),
            took_ms = %t0.elapsed().as_millis(),
            "seeded"
        );

        // A cleanly ended stream (server-side timeout) is reopened from the
        // current baseline without a relist.
        loop {
            let from = self.state.baseline();
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => return RoundEnd::Cancelled,
                res = with_deadline(self.cfg.request_timeout, self.source.watch(&self.descriptor, from)) => match res {
                    Ok(s) => s,
                    Err(e) => return RoundEnd::Failed(e),
                },
            };
            self.health.send_modify(|h| {
                h.phase = SyncPhase::Syncing;
                h.last_error = None;
            });
            let active = ActiveWatch::open(&self.cluster);
            debug!(cluster = %self.cluster, gvr = %self.gvr, token = %from, "watch opened");
            let end = self.stream_events(stream, attempt).await;
            drop(active);
            match end {
                None => debug!(cluster = %self.cluster, gvr = %self.gvr, "watch ended; resuming"),
                Some(end) => return end,
            }
        }
    }

    /// Apply events until cancellation or failure. `None` means the stream ended cleanly.
    async fn stream_events(&mut self, mut stream: EventStream, attempt: &mut u32) -> Option<RoundEnd> {
        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(RoundEnd::Cancelled),
                next = stream.next() => match next {
                    None => return None,
                    Some(Err(e)) => return Some(RoundEnd::Failed(e)),
                    Some(Ok(ev)) => ev,
                },
            };
            *attempt = 0;
            let mut batch = vec![first];
            let mut tail: Option<Option<RoundEnd>> = None;
            // Coalesce whatever is already buffered into the same swap.
            while batch.len() < MAX_BATCH {
                match stream.next().now_or_never() {
                    Some(Some(Ok(ev))) => batch.push(ev),
                    Some(Some(Err(e))) => {
                        tail = Some(Some(RoundEnd::Failed(e)));
                        break;
                    }
                    Some(None) => {
                        tail = Some(None);
                        break;
                    }
                    None => break,
                }
            }
            self.apply_batch(batch);
            if let Some(end) = tail {
                return end;
            }
        }
    }

    fn apply_batch(&mut self, batch: Vec<WatchEvent>) {
        let mut applied = 0u64;
        let mut stale = 0u64;
        for ev in batch {
            match self.state.apply(ev) {
                ApplyOutcome::Applied => applied += 1,
                ApplyOutcome::Stale => stale += 1,
                ApplyOutcome::Bookmark => {}
            }
        }
        if applied > 0 {
            self.publish();
            metrics::counter!("fleet_watch_events_applied_total", applied, "cluster" => self.cluster.clone());
        }
        if stale > 0 {
            debug!(cluster = %self.cluster, gvr = %self.gvr, stale, "dropped stale events");
            metrics::counter!("fleet_watch_events_stale_total", stale, "cluster" => self.cluster.clone());
        }
        self.health.send_modify(|h| {
            h.objects = self.state.len();
            h.baseline = self.state.baseline();
            h.stale_dropped += stale;
            h.last_synced_at = Some(Utc::now());
        });
    }

    fn publish(&self) {
        self.snap.store(self.state.freeze());
    }
}
