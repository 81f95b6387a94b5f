//! `ClusterSource` backed by a real API server through kube-rs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_core::{CachedObject, ConnectionInfo, Listing, ResourceTypeDescriptor, VersionToken, WatchEvent};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::DynamicObject,
    discovery::{self, verbs, ApiResource, Scope},
    Client, Config,
};
use tracing::{debug, info, warn};

use crate::source::{ClusterSource, Connector, EventStream, SourceError};

/// Page size for list requests.
const PAGE_SIZE: u32 = 500;

/// Server-side watch timeout; the stream ends cleanly afterwards and is reopened.
const WATCH_TIMEOUT_SECS: u32 = 290;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds kube clients from connection info.
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

impl KubeConnector {
    pub fn new() -> Self {
        Self
    }
}

async fn config_for(info: &ConnectionInfo) -> Result<Config, SourceError> {
    let connect_err = |e: &dyn std::fmt::Display| SourceError::Connect(e.to_string());
    let mut config = match info {
        ConnectionInfo::Kubeconfig { yaml, context } => {
            let kc = Kubeconfig::from_yaml(yaml).map_err(|e| connect_err(&e))?;
            let opts = KubeConfigOptions { context: context.clone(), ..Default::default() };
            Config::from_custom_kubeconfig(kc, &opts).await.map_err(|e| connect_err(&e))?
        }
        ConnectionInfo::KubeconfigPath { path, context } => {
            let kc = Kubeconfig::read_from(path).map_err(|e| connect_err(&e))?;
            let opts = KubeConfigOptions { context: context.clone(), ..Default::default() };
            Config::from_custom_kubeconfig(kc, &opts).await.map_err(|e| connect_err(&e))?
        }
        ConnectionInfo::InCluster => Config::incluster().map_err(|e| connect_err(&e))?,
        ConnectionInfo::Infer => Config::infer().await.map_err(|e| connect_err(&e))?,
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    Ok(config)
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, cluster: &str, info: &ConnectionInfo) -> Result<Arc<dyn ClusterSource>, SourceError> {
        let t0 = Instant::now();
        let config = config_for(info).await?;
        let client = Client::try_from(config).map_err(|e| SourceError::Connect(e.to_string()))?;
        info!(cluster = %cluster, took_ms = %t0.elapsed().as_millis(), "kube client ready");
        Ok(Arc::new(KubeSource::new(client)))
    }
}

/// Protocol client for one cluster.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, rt: &ResourceTypeDescriptor) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: rt.group.clone(),
            version: rt.version.clone(),
            api_version: rt.api_version(),
            kind: rt.kind.clone(),
            plural: rt.plural.clone(),
        };
        Api::all_with(self.client.clone(), &ar)
    }
}

fn map_kube_err(e: kube::Error, from: VersionToken) -> SourceError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => SourceError::Gone(from),
        kube::Error::Api(resp) => SourceError::Api(format!("{} ({})", resp.message, resp.code)),
        kube::Error::HyperError(e) => SourceError::Connect(e.to_string()),
        kube::Error::Service(e) => SourceError::Connect(e.to_string()),
        other => SourceError::Api(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Convert a dynamic object into the cache's tagged record.
pub fn object_from(rt: &ResourceTypeDescriptor, obj: &DynamicObject) -> Result<CachedObject, SourceError> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| SourceError::Decode("object missing metadata.name".into()))?;
    let rv = obj
        .metadata
        .resource_version
        .as_deref()
        .ok_or_else(|| SourceError::Decode(format!("{} missing metadata.resourceVersion", name)))?;
    let token = rv
        .parse::<VersionToken>()
        .map_err(|_| SourceError::Decode(format!("{} has non-numeric resourceVersion '{}'", name, rv)))?;
    let labels = obj
        .metadata
        .labels
        .as_ref()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let mut payload = serde_json::to_value(obj).map_err(|e| SourceError::Decode(e.to_string()))?;
    strip_managed_fields(&mut payload);
    Ok(CachedObject {
        group: rt.group.clone(),
        version: rt.version.clone(),
        kind: rt.kind.clone(),
        namespace: obj.metadata.namespace.clone(),
        name,
        uid: obj.metadata.uid.clone(),
        labels,
        token,
        payload,
    })
}

fn event_from(rt: &ResourceTypeDescriptor, ev: KubeEvent<DynamicObject>, from: VersionToken) -> Option<Result<WatchEvent, SourceError>> {
    let convert = |o: &DynamicObject| match object_from(rt, o) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(gvr = %rt.key(), error = %e, "dropping undecodable watch event");
            None
        }
    };
    match ev {
        KubeEvent::Added(o) => convert(&o).map(|o| Ok(WatchEvent::Added(o))),
        KubeEvent::Modified(o) => convert(&o).map(|o| Ok(WatchEvent::Modified(o))),
        KubeEvent::Deleted(o) => convert(&o).map(|o| Ok(WatchEvent::Deleted(o))),
        KubeEvent::Bookmark(b) => b.metadata.resource_version.parse::<VersionToken>().ok().map(|t| Ok(WatchEvent::Bookmark(t))),
        KubeEvent::Error(resp) if resp.code == 410 => Some(Err(SourceError::Gone(from))),
        KubeEvent::Error(resp) => Some(Err(SourceError::Api(format!("{} ({})", resp.message, resp.code)))),
    }
}

#[async_trait]
impl ClusterSource for KubeSource {
    async fn api_groups(&self) -> Result<Vec<String>, SourceError> {
        // Probing the core versions first distinguishes "unreachable" from "no groups".
        self.client.list_core_api_versions().await.map_err(|e| map_kube_err(e, VersionToken::default()))?;
        let groups = self.client.list_api_groups().await.map_err(|e| map_kube_err(e, VersionToken::default()))?;
        let mut out = vec![String::new()];
        out.extend(groups.groups.into_iter().map(|g| g.name));
        Ok(out)
    }

    async fn group_resources(&self, group: &str) -> Result<Vec<ResourceTypeDescriptor>, SourceError> {
        let g = discovery::group(&self.client, group).await.map_err(|e| map_kube_err(e, VersionToken::default()))?;
        let mut out = Vec::new();
        for (ar, caps) in g.recommended_resources() {
            // Skip subresources (e.g., pods/log, pods/exec)
            if ar.plural.contains('/') {
                continue;
            }
            if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
                debug!(group = %group, plural = %ar.plural, "skipping type without list/watch");
                continue;
            }
            out.push(ResourceTypeDescriptor {
                group: ar.group.clone(),
                version: ar.version.clone(),
                plural: ar.plural.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
        Ok(out)
    }

    async fn list(&self, rt: &ResourceTypeDescriptor) -> Result<Listing, SourceError> {
        let api = self.api_for(rt);
        let mut items = Vec::new();
        let mut token: Option<VersionToken> = None;
        let mut lp = ListParams::default().limit(PAGE_SIZE);
        loop {
            let page = api.list(&lp).await.map_err(|e| map_kube_err(e, VersionToken::default()))?;
            // Continuation pages are served from the first page's snapshot.
            if token.is_none() {
                let rv = page.metadata.resource_version.as_deref().unwrap_or("0");
                token = Some(rv.parse::<VersionToken>().map_err(|_| {
                    SourceError::Decode(format!("list of {} has non-numeric resourceVersion '{}'", rt.key(), rv))
                })?);
            }
            for o in page.items.iter() {
                match object_from(rt, o) {
                    Ok(obj) => items.push(obj),
                    Err(e) => warn!(gvr = %rt.key(), error = %e, "skipping undecodable object"),
                }
            }
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(next) => lp = ListParams::default().limit(PAGE_SIZE).continue_token(&next),
                None => break,
            }
        }
        Ok(Listing { items, token: token.unwrap_or_default() })
    }

    async fn watch(&self, rt: &ResourceTypeDescriptor, from: VersionToken) -> Result<EventStream, SourceError> {
        let api = self.api_for(rt);
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = api.watch(&wp, &from.to_string()).await.map_err(|e| map_kube_err(e, from))?;
        let rt = rt.clone();
        let mapped = stream
            .map_err(move |e| map_kube_err(e, from))
            .filter_map(move |res| {
                let out = match res {
                    Ok(ev) => event_from(&rt, ev, from),
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(out)
            });
        Ok(mapped.boxed())
    }
}
