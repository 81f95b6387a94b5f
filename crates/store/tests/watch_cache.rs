#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{CacheConfig, CachedObject, ObjectKey, ResourceTypeDescriptor, SyncPhase, VersionToken, WatchEvent};
use fleet_kubehub::{ClusterSource, FakeCluster, SourceError};
use fleet_store::WatchCache;
use tokio_util::sync::CancellationToken;

fn pods() -> ResourceTypeDescriptor {
    ResourceTypeDescriptor { group: String::new(), version: "v1".into(), plural: "pods".into(), kind: "Pod".into(), namespaced: true }
}

fn fast_cfg() -> CacheConfig {
    CacheConfig {
        refresh_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        teardown_timeout: Duration::from_secs(1),
    }
}

async fn wait_for(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spawn(fake: &Arc<FakeCluster>) -> WatchCache {
    let source: Arc<dyn ClusterSource> = fake.clone();
    WatchCache::spawn("c1", pods(), source, fast_cfg(), CancellationToken::new())
}

fn names(cache: &WatchCache, ns: Option<&str>) -> Vec<String> {
    cache.snapshot().list(ns, None).iter().map(|o| o.name.clone()).collect()
}

fn sorted(mut objs: Vec<CachedObject>) -> Vec<CachedObject> {
    objs.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    objs
}

/// Everything the cache holds, as owned objects in key order.
fn cached(cache: &WatchCache) -> Vec<CachedObject> {
    sorted(cache.snapshot().list(None, None).iter().map(|o| o.as_ref().clone()).collect())
}

async fn served(fake: &FakeCluster) -> Vec<CachedObject> {
    sorted(fake.list(&pods()).await.unwrap().items)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seed_then_delete_is_reflected() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.upsert(&pods(), Some("default"), "a", serde_json::json!({ "metadata": { "labels": { "app": "web" } }, "spec": { "n": 1 } }));
    fake.upsert(&pods(), Some("default"), "b", serde_json::json!({ "spec": { "n": 2 } }));
    fake.upsert(&pods(), Some("kube-system"), "dns", serde_json::json!({}));

    let cache = spawn(&fake);
    wait_for("seed", || cache.snapshot().seeded).await;
    assert_eq!(names(&cache, Some("default")), vec!["a", "b"]);
    assert_eq!(cache.snapshot().len(), 3);
    // Payload, labels and tokens match what the server listed.
    assert_eq!(cached(&cache), served(&fake).await);

    let token = fake.delete(&pods(), Some("default"), "a").unwrap();
    wait_for("delete applied", || cache.snapshot().baseline >= token).await;
    assert_eq!(names(&cache, Some("default")), vec!["b"]);
    assert!(cache.snapshot().get(&ObjectKey::new(Some("default"), "a")).is_none());
    assert_eq!(cached(&cache), served(&fake).await);
    cache.stop(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn older_event_is_dropped_as_stale() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    let first = fake.upsert(&pods(), Some("default"), "a", serde_json::json!({ "v": "old" }));
    let second = fake.upsert(&pods(), Some("default"), "a", serde_json::json!({ "v": "new" }));

    let cache = spawn(&fake);
    wait_for("subscribed", || cache.is_subscribed()).await;

    let late = CachedObject {
        group: String::new(),
        version: "v1".into(),
        kind: "Pod".into(),
        namespace: Some("default".into()),
        name: "a".into(),
        uid: None,
        labels: Default::default(),
        token: first,
        payload: serde_json::json!({ "v": "old" }),
    };
    fake.inject(&pods(), WatchEvent::Modified(late));
    wait_for("stale counted", || cache.health().stale_dropped == 1).await;

    let snap = cache.snapshot();
    let a = snap.get(&ObjectKey::new(Some("default"), "a")).unwrap();
    assert_eq!(a.token, second);
    assert_eq!(a.payload["v"], "new");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gone_watch_degrades_then_reseeds() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.upsert(&pods(), Some("default"), "a", serde_json::json!({}));

    let cache = spawn(&fake);
    wait_for("subscribed", || cache.is_subscribed()).await;
    assert_eq!(fake.list_calls(&pods()), 1);

    fake.compact(&pods());
    fake.break_watches(&pods(), SourceError::Gone(VersionToken(1)));
    wait_for("reseeded", || fake.list_calls(&pods()) >= 2 && cache.is_subscribed()).await;

    let health = cache.health();
    assert_eq!(health.restarts, 1);
    assert!(health.last_error.is_none());
    assert_eq!(health.phase, SyncPhase::Syncing);

    fake.upsert(&pods(), Some("default"), "b", serde_json::json!({}));
    wait_for("new pod after reseed", || cache.snapshot().len() == 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_listing_keeps_retrying() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.set_unreachable(true);

    let cache = spawn(&fake);
    wait_for("degraded", || cache.health().restarts >= 2).await;
    let health = cache.health();
    assert!(!health.seeded);
    assert!(health.last_error.as_deref().unwrap_or_default().contains("connection refused"));

    fake.set_unreachable(false);
    wait_for("recovered", || cache.is_subscribed()).await;
    assert!(cache.snapshot().seeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_releases_watch_and_empties_snapshot() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.upsert(&pods(), Some("default"), "a", serde_json::json!({}));

    let cache = spawn(&fake);
    wait_for("subscribed", || cache.is_subscribed()).await;
    assert_eq!(fake.open_watches(&pods()), 1);

    let mut health = cache.subscribe_health();
    let snap = cache.snapshot();
    cache.stop(Duration::from_secs(1)).await;

    assert_eq!(fake.open_watches(&pods()), 0);
    assert_eq!(health.borrow_and_update().phase, SyncPhase::Stopped);
    // Readers holding an old snapshot keep it.
    assert_eq!(snap.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_without_grace_still_reports_stopped() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.upsert(&pods(), Some("default"), "a", serde_json::json!({}));

    let cache = spawn(&fake);
    wait_for("subscribed", || cache.is_subscribed()).await;

    let mut health = cache.subscribe_health();
    cache.stop(Duration::ZERO).await;

    let h = health.borrow_and_update().clone();
    assert_eq!(h.phase, SyncPhase::Stopped);
    assert_eq!(h.objects, 0);
    assert!(!h.seeded);
    // The watch stream was dropped with the task.
    wait_for("watch released", || fake.open_watches(&pods()) == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_readers_never_see_torn_objects() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.upsert(&pods(), Some("default"), "x", serde_json::json!({ "spec": { "a": 0, "b": 0 } }));

    let cache = Arc::new(spawn(&fake));
    wait_for("subscribed", || cache.is_subscribed()).await;

    let writer = {
        let fake = fake.clone();
        tokio::spawn(async move {
            for i in 1..=200u64 {
                fake.upsert(&pods(), Some("default"), "x", serde_json::json!({ "spec": { "a": i, "b": i } }));
                if i % 20 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };
    let reader = {
        let cache = cache.clone();
        tokio::spawn(async move {
            let mut last = VersionToken(0);
            for _ in 0..500 {
                let snap = cache.snapshot();
                for o in snap.list(Some("default"), None) {
                    assert_eq!(o.payload["spec"]["a"], o.payload["spec"]["b"]);
                    assert!(o.token >= last);
                    last = o.token;
                }
                tokio::task::yield_now().await;
            }
        })
    };
    writer.await.unwrap();
    reader.await.unwrap();
    wait_for("final update", || {
        cache.snapshot().get(&ObjectKey::new(Some("default"), "x")).map(|o| o.payload["spec"]["a"] == 200).unwrap_or(false)
    })
    .await;
}
