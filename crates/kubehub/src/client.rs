//! `ClusterClient` backed by kube-rs typed APIs.

use std::fmt::Debug;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Resource,
};
use kubelive_core::{ResourceKind, ResourceSnapshot};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{ClusterClient, ClusterError, DeltaStream, ListPage, WatchCursor, WatchDelta};

/// kube-rs client bound to a single namespace.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    namespace: String,
}

impl KubeClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into() }
    }

    /// Build a client from an explicit kubeconfig file, or kube's inferred config when `None`.
    pub async fn connect(kubeconfig: Option<&Path>, namespace: &str) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)
                    .with_context(|| format!("reading kubeconfig {}", path.display()))?;
                let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .context("building client config from kubeconfig")?;
                Client::try_from(cfg).context("creating kube client")?
            }
            None => Client::try_default().await.context("inferring kube client config")?,
        };
        info!(ns = %namespace, kubeconfig = ?kubeconfig, "kube client ready");
        Ok(Self::new(client, namespace))
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

async fn list_typed<K>(api: Api<K>) -> Result<ListPage, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Into<ResourceSnapshot>,
{
    let list = api.list(&ListParams::default()).await?;
    let cursor = WatchCursor::new(list.metadata.resource_version.unwrap_or_default());
    let items = list.items.into_iter().map(Into::into).collect();
    Ok(ListPage { items, cursor })
}

async fn watch_typed<K>(api: Api<K>, from: &WatchCursor) -> Result<DeltaStream, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static + Into<ResourceSnapshot>,
{
    let stream = api.watch(&WatchParams::default(), from.as_str()).await?;
    Ok(stream
        .map(|ev| match ev {
            Ok(WatchEvent::Added(o)) => Ok(WatchDelta::Added(o.into())),
            Ok(WatchEvent::Modified(o)) => Ok(WatchDelta::Modified(o.into())),
            Ok(WatchEvent::Deleted(o)) => Ok(WatchDelta::Deleted(o.into())),
            Ok(WatchEvent::Bookmark(b)) => Ok(WatchDelta::Bookmark(WatchCursor::new(b.metadata.resource_version))),
            Ok(WatchEvent::Error(status)) => Err(ClusterError::from_status(status.code, status.message)),
            Err(e) => Err(ClusterError::from(e)),
        })
        .boxed())
}

#[async_trait]
impl ClusterClient for KubeClient {
    fn namespace(&self) -> &str { &self.namespace }

    async fn list(&self, kind: ResourceKind) -> Result<ListPage, ClusterError> {
        let t0 = Instant::now();
        let page = match kind {
            ResourceKind::Pods => list_typed(self.api::<Pod>()).await,
            ResourceKind::Deployments => list_typed(self.api::<Deployment>()).await,
            ResourceKind::Services => list_typed(self.api::<Service>()).await,
            ResourceKind::ConfigMaps => list_typed(self.api::<ConfigMap>()).await,
            ResourceKind::Secrets => list_typed(self.api::<Secret>()).await,
            ResourceKind::ReplicaSets => list_typed(self.api::<ReplicaSet>()).await,
            ResourceKind::DaemonSets => list_typed(self.api::<DaemonSet>()).await,
        }?;
        debug!(kind = %kind, items = page.items.len(), cursor = %page.cursor, took_ms = %t0.elapsed().as_millis(), "list ok");
        Ok(page)
    }

    async fn watch(&self, kind: ResourceKind, from: &WatchCursor) -> Result<DeltaStream, ClusterError> {
        match kind {
            ResourceKind::Pods => watch_typed(self.api::<Pod>(), from).await,
            ResourceKind::Deployments => watch_typed(self.api::<Deployment>(), from).await,
            ResourceKind::Services => watch_typed(self.api::<Service>(), from).await,
            ResourceKind::ConfigMaps => watch_typed(self.api::<ConfigMap>(), from).await,
            ResourceKind::Secrets => watch_typed(self.api::<Secret>(), from).await,
            ResourceKind::ReplicaSets => watch_typed(self.api::<ReplicaSet>(), from).await,
            ResourceKind::DaemonSets => watch_typed(self.api::<DaemonSet>(), from).await,
        }
    }

    async fn get_scale(&self, deployment: &str) -> Result<Scale, ClusterError> {
        Ok(self.api::<Deployment>().get_scale(deployment).await?)
    }

    async fn replace_scale(&self, deployment: &str, scale: &Scale) -> Result<Scale, ClusterError> {
        let data = serde_json::to_vec(scale).map_err(|e| ClusterError::Decode(e.to_string()))?;
        Ok(self.api::<Deployment>().replace_scale(deployment, &PostParams::default(), data).await?)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let _ = self.api::<Pod>().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
