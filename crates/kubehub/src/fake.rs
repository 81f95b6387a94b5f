//! In-memory cluster implementing `ClusterSource`, for tests and demos.
//!
//! Objects get a cluster-wide increasing revision like etcd hands out. Every
//! change is kept in a per-type event log so watches opened from an older
//! token replay what they missed; `compact` discards that history so such
//! watches fail with `Gone`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{CachedObject, ConnectionInfo, Listing, ObjectKey, ResourceTypeDescriptor, VersionToken, WatchEvent};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::source::{ClusterSource, Connector, EventStream, SourceError};

type Subscriber = mpsc::UnboundedSender<Result<WatchEvent, SourceError>>;

#[derive(Default)]
struct TypeState {
    descriptor: Option<ResourceTypeDescriptor>,
    objects: BTreeMap<ObjectKey, CachedObject>,
    log: Vec<WatchEvent>,
    compacted: VersionToken,
    subscribers: Vec<Subscriber>,
    list_calls: usize,
}

#[derive(Default)]
struct FakeState {
    revision: u64,
    /// Group name -> plural keys served by it.
    groups: BTreeMap<String, BTreeSet<String>>,
    types: HashMap<String, TypeState>,
    failing_groups: BTreeSet<String>,
    unreachable: bool,
    list_delay: Option<Duration>,
}

impl FakeState {
    fn next_token(&mut self) -> VersionToken {
        self.revision += 1;
        VersionToken(self.revision)
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `rt` from now on.
    pub fn add_type(&self, rt: ResourceTypeDescriptor) {
        let mut st = self.state.lock();
        let key = rt.key();
        st.groups.entry(rt.group.clone()).or_default().insert(key.clone());
        st.types.entry(key).or_default().descriptor = Some(rt);
    }

    /// Stop serving `rt`; open watches on it end.
    pub fn remove_type(&self, rt: &ResourceTypeDescriptor) {
        let mut st = self.state.lock();
        if let Some(keys) = st.groups.get_mut(&rt.group) {
            keys.remove(&rt.key());
            if keys.is_empty() {
                st.groups.remove(&rt.group);
            }
        }
        st.types.remove(&rt.key());
    }

    pub fn fail_group(&self, group: &str) {
        self.state.lock().failing_groups.insert(group.to_string());
    }

    pub fn heal_group(&self, group: &str) {
        self.state.lock().failing_groups.remove(group);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.state.lock().list_delay = delay;
    }

    /// Create or update an object and notify watchers. Returns the new token.
    pub fn upsert(&self, rt: &ResourceTypeDescriptor, namespace: Option<&str>, name: &str, payload: serde_json::Value) -> VersionToken {
        let mut st = self.state.lock();
        let token = st.next_token();
        let labels = payload
            .pointer("/metadata/labels")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
            .unwrap_or_default();
        let obj = CachedObject {
            group: rt.group.clone(),
            version: rt.version.clone(),
            kind: rt.kind.clone(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            uid: None,
            labels,
            token,
            payload,
        };
        let ts = st.types.entry(rt.key()).or_default();
        let existed = ts.objects.insert(obj.key(), obj.clone()).is_some();
        let ev = if existed { WatchEvent::Modified(obj) } else { WatchEvent::Added(obj) };
        publish(ts, ev);
        token
    }

    /// Delete an object and notify watchers.
    pub fn delete(&self, rt: &ResourceTypeDescriptor, namespace: Option<&str>, name: &str) -> Option<VersionToken> {
        let mut st = self.state.lock();
        let token = st.next_token();
        let ts = st.types.get_mut(&rt.key())?;
        let mut obj = ts.objects.remove(&ObjectKey::new(namespace, name))?;
        obj.token = token;
        publish(ts, WatchEvent::Deleted(obj));
        Some(token)
    }

    /// Deliver an arbitrary event to current watchers without changing stored objects.
    pub fn inject(&self, rt: &ResourceTypeDescriptor, ev: WatchEvent) {
        let mut st = self.state.lock();
        if let Some(ts) = st.types.get_mut(&rt.key()) {
            ts.subscribers.retain(|tx| tx.send(Ok(ev.clone())).is_ok());
        }
    }

    /// Fail every open watch on `rt` with `err` and close it.
    pub fn break_watches(&self, rt: &ResourceTypeDescriptor, err: SourceError) {
        let mut st = self.state.lock();
        if let Some(ts) = st.types.get_mut(&rt.key()) {
            for tx in ts.subscribers.drain(..) {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// Forget the change history of `rt`; watches from older tokens get `Gone`.
    pub fn compact(&self, rt: &ResourceTypeDescriptor) {
        let mut st = self.state.lock();
        let current = VersionToken(st.revision);
        if let Some(ts) = st.types.get_mut(&rt.key()) {
            ts.log.clear();
            ts.compacted = current;
        }
    }

    /// Number of watches on `rt` whose consumer is still alive.
    pub fn open_watches(&self, rt: &ResourceTypeDescriptor) -> usize {
        let mut st = self.state.lock();
        match st.types.get_mut(&rt.key()) {
            Some(ts) => {
                ts.subscribers.retain(|tx| !tx.is_closed());
                ts.subscribers.len()
            }
            None => 0,
        }
    }

    pub fn total_open_watches(&self) -> usize {
        let mut st = self.state.lock();
        st.types
            .values_mut()
            .map(|ts| {
                ts.subscribers.retain(|tx| !tx.is_closed());
                ts.subscribers.len()
            })
            .sum()
    }

    pub fn list_calls(&self, rt: &ResourceTypeDescriptor) -> usize {
        self.state.lock().types.get(&rt.key()).map(|ts| ts.list_calls).unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<(), SourceError> {
        if self.state.lock().unreachable {
            return Err(SourceError::Connect("connection refused".into()));
        }
        Ok(())
    }
}

fn publish(ts: &mut TypeState, ev: WatchEvent) {
    ts.log.push(ev.clone());
    ts.subscribers.retain(|tx| tx.send(Ok(ev.clone())).is_ok());
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn api_groups(&self) -> Result<Vec<String>, SourceError> {
        self.check_reachable()?;
        Ok(self.state.lock().groups.keys().cloned().collect())
    }

    async fn group_resources(&self, group: &str) -> Result<Vec<ResourceTypeDescriptor>, SourceError> {
        self.check_reachable()?;
        let st = self.state.lock();
        if st.failing_groups.contains(group) {
            return Err(SourceError::Api(format!("discovery for group '{}' failed (503)", group)));
        }
        let keys = st.groups.get(group).cloned().unwrap_or_default();
        Ok(keys.iter().filter_map(|k| st.types.get(k).and_then(|ts| ts.descriptor.clone())).collect())
    }

    async fn list(&self, rt: &ResourceTypeDescriptor) -> Result<Listing, SourceError> {
        self.check_reachable()?;
        let delay = self.state.lock().list_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state.lock();
        let token = VersionToken(st.revision);
        let ts = st
            .types
            .get_mut(&rt.key())
            .filter(|ts| ts.descriptor.is_some())
            .ok_or_else(|| SourceError::Api(format!("{} not found (404)", rt.key())))?;
        ts.list_calls += 1;
        Ok(Listing { items: ts.objects.values().cloned().collect(), token })
    }

    async fn watch(&self, rt: &ResourceTypeDescriptor, from: VersionToken) -> Result<EventStream, SourceError> {
        self.check_reachable()?;
        let mut st = self.state.lock();
        let ts = st
            .types
            .get_mut(&rt.key())
            .filter(|ts| ts.descriptor.is_some())
            .ok_or_else(|| SourceError::Api(format!("{} not found (404)", rt.key())))?;
        if from < ts.compacted {
            return Err(SourceError::Gone(from));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for ev in ts.log.iter().filter(|ev| ev.token() > from) {
            let _ = tx.send(Ok(ev.clone()));
        }
        ts.subscribers.push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) });
        Ok(stream.boxed())
    }
}

/// Hands out pre-built fake clusters by cluster id.
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<HashMap<String, Arc<FakeCluster>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, cluster: &str, fake: Arc<FakeCluster>) {
        self.clusters.lock().insert(cluster.to_string(), fake);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, cluster: &str, _info: &ConnectionInfo) -> Result<Arc<dyn ClusterSource>, SourceError> {
        let fake = self
            .clusters
            .lock()
            .get(cluster)
            .cloned()
            .ok_or_else(|| SourceError::Connect(format!("no such cluster '{}'", cluster)))?;
        Ok(fake as Arc<dyn ClusterSource>)
    }
}
