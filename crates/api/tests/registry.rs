#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_api::{
    CacheConfig, CachedObject, ClusterRegistry, ConnectionInfo, FleetApi, FleetError, LifecycleState, ResourceTypeDescriptor,
};
use fleet_kubehub::{ClusterSource, FakeCluster, FakeConnector};

fn rt(group: &str, plural: &str, kind: &str, namespaced: bool) -> ResourceTypeDescriptor {
    ResourceTypeDescriptor { group: group.into(), version: "v1".into(), plural: plural.into(), kind: kind.into(), namespaced }
}

fn pods() -> ResourceTypeDescriptor {
    rt("", "pods", "Pod", true)
}

fn deployments() -> ResourceTypeDescriptor {
    rt("apps", "deployments", "Deployment", true)
}

fn cfg() -> CacheConfig {
    CacheConfig {
        refresh_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        teardown_timeout: Duration::from_secs(1),
    }
}

fn registry_with(clusters: &[(&str, &Arc<FakeCluster>)]) -> ClusterRegistry {
    let connector = FakeConnector::new();
    for (id, fake) in clusters {
        connector.insert(id, (*fake).clone());
    }
    ClusterRegistry::new(connector, cfg())
}

async fn ready(reg: &ClusterRegistry, id: &str) {
    for _ in 0..300 {
        if reg.cluster_status(id).await.map(|s| s.state == LifecycleState::Ready).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cluster {id} never became ready");
}

fn names(items: &[Arc<CachedObject>]) -> Vec<&str> {
    items.iter().map(|o| o.name.as_str()).collect()
}

fn owned(items: &[Arc<CachedObject>]) -> Vec<CachedObject> {
    let mut out: Vec<CachedObject> = items.iter().map(|o| o.as_ref().clone()).collect();
    out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    out
}

/// Pods as the server lists them right now.
async fn served_pods(fake: &FakeCluster) -> Vec<CachedObject> {
    let mut items = fake.list(&pods()).await.unwrap().items;
    items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    items
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pods_listed_then_delete_observed() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.upsert(&pods(), Some("default"), "a", serde_json::json!({ "metadata": { "labels": { "app": "web" } } }));
    fake.upsert(&pods(), Some("default"), "b", serde_json::json!({ "metadata": { "labels": { "app": "db" } } }));
    let reg = registry_with(&[("c1", &fake)]);

    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;

    let items = reg.list("c1", "pods", Some("default"), None).await.unwrap();
    assert_eq!(names(&items), vec!["a", "b"]);
    assert_eq!(owned(&items), served_pods(&fake).await);
    let web = reg.list("c1", "pod", None, Some("app=web")).await.unwrap();
    assert_eq!(names(&web), vec!["a"]);

    fake.delete(&pods(), Some("default"), "a").unwrap();
    let mut left = Vec::new();
    for _ in 0..300 {
        left = reg.list("c1", "pods", Some("default"), None).await.unwrap();
        if left.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(names(&left), vec!["b"]);
    assert_eq!(owned(&left), served_pods(&fake).await);
    let err = reg.get("c1", "Pod", Some("default"), "a").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
    assert_eq!(reg.get("c1", "Pod", Some("default"), "b").await.unwrap().name, "b");
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kind_spellings_resolve_identically() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.add_type(deployments());
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;

    let want = reg.resolve_kind("c1", "pod").await.unwrap();
    for raw in ["pods", "Pod", "Pods"] {
        assert_eq!(reg.resolve_kind("c1", raw).await.unwrap(), want);
    }
    assert_eq!(reg.resolve_kind("c1", "deployments.apps").await.unwrap(), deployments());
    let err = reg.resolve_kind("c1", "widgets").await.unwrap_err();
    assert!(matches!(err, FleetError::UnknownKind(_)));
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deregister_stops_everything() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.add_type(deployments());
    fake.upsert(&pods(), Some("default"), "a", serde_json::json!({}));
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;
    assert_eq!(reg.active_subscriptions("c1").await.unwrap(), 2);
    assert_eq!(fake.total_open_watches(), 2);

    reg.deregister_cluster("c1").await.unwrap();
    assert_eq!(fake.total_open_watches(), 0);
    assert!(reg.clusters().await.is_empty());
    assert!(matches!(reg.list("c1", "pods", None, None).await, Err(FleetError::ClusterUnknown(_))));
    assert!(matches!(reg.get("c1", "pods", Some("default"), "a").await, Err(FleetError::ClusterUnknown(_))));
    assert!(matches!(reg.active_subscriptions("c1").await, Err(FleetError::ClusterUnknown(_))));
    assert!(matches!(reg.deregister_cluster("c1").await, Err(FleetError::ClusterUnknown(_))));

    // The id can be reused afterwards.
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_registration_is_rejected() {
    let fake = FakeCluster::new();
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::InCluster).await.unwrap();
    let err = reg.register_cluster("c1", ConnectionInfo::InCluster).await.unwrap_err();
    assert!(matches!(err, FleetError::AlreadyExists(_)));
    assert_eq!(reg.clusters().await, vec!["c1".to_string()]);
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_group_leaves_other_kinds_usable() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.add_type(deployments());
    fake.add_type(rt("batch", "jobs", "Job", true));
    fake.fail_group("apps");
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;

    assert!(reg.resolve_kind("c1", "jobs").await.is_ok());
    assert!(reg.list("c1", "pods", None, None).await.is_ok());
    assert!(matches!(reg.resolve_kind("c1", "deployments").await, Err(FleetError::UnknownKind(_))));
    let status = reg.cluster_status("c1").await.unwrap();
    assert_eq!(status.discovery_failures.len(), 1);
    assert_eq!(status.discovery_failures[0].group, "apps");
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_failing_later_keeps_its_caches() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.add_type(deployments());
    fake.upsert(&deployments(), Some("default"), "web", serde_json::json!({}));
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;

    fake.fail_group("apps");
    for _ in 0..300 {
        if !reg.cluster_status("c1").await.unwrap().discovery_failures.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!reg.cluster_status("c1").await.unwrap().discovery_failures.is_empty());
    let items = reg.list("c1", "deployments", Some("default"), None).await.unwrap();
    assert_eq!(names(&items), vec!["web"]);
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_before_first_discovery_reports_the_cause() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.set_unreachable(true);
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();

    // Until the first pass has failed the answer is still `DiscoveryPending`.
    let mut err = reg.resolve_kind("c1", "pods").await.unwrap_err();
    for _ in 0..300 {
        if !matches!(err, FleetError::DiscoveryPending(_)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        err = reg.resolve_kind("c1", "pods").await.unwrap_err();
    }
    assert!(matches!(&err, FleetError::ClusterUnreachable(msg) if msg.contains("connection refused")), "{err:?}");
    assert!(err.is_retryable());
    let err = reg.list("c1", "pods", None, None).await.unwrap_err();
    assert!(matches!(err, FleetError::ClusterUnreachable(_)));
    assert_eq!(reg.cluster_status("c1").await.unwrap().state, LifecycleState::Degraded);

    // Waiting gives up on the real cause instead of running into its timeout.
    let t0 = Instant::now();
    let err = reg.wait_for_kind("c1", "pods", Duration::from_secs(10)).await.unwrap_err();
    assert!(matches!(err, FleetError::ClusterUnreachable(_)));
    assert!(t0.elapsed() < Duration::from_secs(5));

    fake.set_unreachable(false);
    ready(&reg, "c1").await;
    assert!(reg.list("c1", "pods", None, None).await.is_ok());
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_before_first_seed_is_not_ready() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    fake.set_list_delay(Some(Duration::from_millis(500)));
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();

    let d = loop {
        match reg.resolve_kind("c1", "pods").await {
            Ok(d) => break d,
            Err(e) => assert!(matches!(e, FleetError::DiscoveryPending(_))),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(d, pods());
    let err = reg.list("c1", "pods", None, None).await.unwrap_err();
    assert!(matches!(err, FleetError::CacheNotReady(_)));
    assert_ne!(reg.cluster_status("c1").await.unwrap().state, LifecycleState::Ready);

    let synced = reg.wait_for_kind("c1", "pods", Duration::from_secs(5)).await.unwrap();
    assert_eq!(synced, pods());
    assert!(reg.list("c1", "pods", None, None).await.is_ok());
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_cluster_turns_degraded_then_recovers() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;

    fake.set_unreachable(true);
    let mut degraded = false;
    for _ in 0..300 {
        let status = reg.cluster_status("c1").await.unwrap();
        if status.state == LifecycleState::Degraded {
            assert!(status.last_error.is_some());
            degraded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(degraded);
    // Cached data stays readable while degraded.
    assert!(reg.list("c1", "pods", None, None).await.is_ok());

    fake.set_unreachable(false);
    ready(&reg, "c1").await;
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clusters_are_isolated() {
    let c1 = FakeCluster::new();
    c1.add_type(pods());
    c1.upsert(&pods(), Some("default"), "only-in-c1", serde_json::json!({}));
    let c2 = FakeCluster::new();
    c2.add_type(pods());
    c2.add_type(rt("", "nodes", "Node", false));
    c2.upsert(&rt("", "nodes", "Node", false), None, "n1", serde_json::json!({}));
    let reg = registry_with(&[("c1", &c1), ("c2", &c2)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    reg.register_cluster("c2", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;
    ready(&reg, "c2").await;

    assert_eq!(reg.list("c1", "pods", None, None).await.unwrap().len(), 1);
    assert!(reg.list("c2", "pods", None, None).await.unwrap().is_empty());
    assert!(matches!(reg.resolve_kind("c1", "nodes").await, Err(FleetError::UnknownKind(_))));
    // Namespace is ignored for cluster-scoped kinds.
    assert_eq!(reg.get("c2", "node", Some("default"), "n1").await.unwrap().name, "n1");

    reg.deregister_cluster("c1").await.unwrap();
    assert_eq!(c1.total_open_watches(), 0);
    assert_eq!(c2.total_open_watches(), 2);
    assert_eq!(reg.clusters().await, vec!["c2".to_string()]);
    reg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_selector_is_rejected() {
    let fake = FakeCluster::new();
    fake.add_type(pods());
    let reg = registry_with(&[("c1", &fake)]);
    reg.register_cluster("c1", ConnectionInfo::Infer).await.unwrap();
    ready(&reg, "c1").await;
    let err = reg.list("c1", "pods", None, Some("app in (web")).await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidSelector(_)));
    assert!(!err.is_retryable());
    reg.shutdown().await;
}
