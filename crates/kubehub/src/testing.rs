//! Scripted in-memory `ClusterClient` for tests.
//!
//! Lists and watch opens are answered from per-kind queues. Watch streams are fed through
//! a [`WatchFeed`] so a test controls exactly when each delta arrives. With nothing queued,
//! `list` fails and `watch` returns a stream that never yields.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec};
use kubelive_core::{ResourceKind, ResourceSnapshot, DEFAULT_NAMESPACE};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;

use crate::{ClusterClient, ClusterError, DeltaStream, ListPage, WatchCursor, WatchDelta};

type DeltaItem = Result<WatchDelta, ClusterError>;

enum WatchScript {
    Fail(ClusterError),
    Stream(mpsc::UnboundedReceiver<DeltaItem>),
}

#[derive(Default)]
struct FakeState {
    lists: FxHashMap<ResourceKind, VecDeque<Result<ListPage, ClusterError>>>,
    watches: FxHashMap<ResourceKind, VecDeque<WatchScript>>,
    list_calls: FxHashMap<ResourceKind, usize>,
    watch_opens: FxHashMap<ResourceKind, Vec<WatchCursor>>,
    scales: FxHashMap<String, Scale>,
    racing: FxHashSet<String>,
    pods: FxHashSet<String>,
    deleted_pods: Vec<String>,
}

pub struct FakeCluster {
    namespace: String,
    state: Mutex<FakeState>,
}

impl Default for FakeCluster {
    fn default() -> Self { Self::new() }
}

/// Sending half of a scripted watch stream. Dropping it ends the stream.
pub struct WatchFeed {
    tx: mpsc::UnboundedSender<DeltaItem>,
}

impl WatchFeed {
    pub fn send(&self, delta: WatchDelta) { let _ = self.tx.send(Ok(delta)); }
    pub fn added(&self, o: impl Into<ResourceSnapshot>) { self.send(WatchDelta::Added(o.into())); }
    pub fn modified(&self, o: impl Into<ResourceSnapshot>) { self.send(WatchDelta::Modified(o.into())); }
    pub fn deleted(&self, o: impl Into<ResourceSnapshot>) { self.send(WatchDelta::Deleted(o.into())); }
    pub fn bookmark(&self, cursor: &str) { self.send(WatchDelta::Bookmark(WatchCursor::new(cursor))); }
    pub fn fail(&self, e: ClusterError) { let _ = self.tx.send(Err(e)); }
    pub fn close(self) {}
}

impl FakeCluster {
    pub fn new() -> Self { Self { namespace: DEFAULT_NAMESPACE.to_string(), state: Mutex::new(FakeState::default()) } }

    pub fn push_list(&self, kind: ResourceKind, items: Vec<ResourceSnapshot>, cursor: &str) {
        let page = ListPage { items, cursor: WatchCursor::new(cursor) };
        self.state.lock().lists.entry(kind).or_default().push_back(Ok(page));
    }

    pub fn push_list_error(&self, kind: ResourceKind, e: ClusterError) {
        self.state.lock().lists.entry(kind).or_default().push_back(Err(e));
    }

    /// Queue a watch stream for the next open of `kind`.
    pub fn push_watch(&self, kind: ResourceKind) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watches.entry(kind).or_default().push_back(WatchScript::Stream(rx));
        WatchFeed { tx }
    }

    /// Make the next watch open of `kind` fail.
    pub fn push_watch_error(&self, kind: ResourceKind, e: ClusterError) {
        self.state.lock().watches.entry(kind).or_default().push_back(WatchScript::Fail(e));
    }

    pub fn list_calls(&self, kind: ResourceKind) -> usize { self.state.lock().list_calls.get(&kind).copied().unwrap_or(0) }

    /// Cursors passed to every watch open of `kind`, in order.
    pub fn watch_opens(&self, kind: ResourceKind) -> Vec<WatchCursor> {
        self.state.lock().watch_opens.get(&kind).cloned().unwrap_or_default()
    }

    pub fn set_scale(&self, deployment: &str, replicas: i32, resource_version: &str) {
        let mut scale = Scale::default();
        scale.metadata.name = Some(deployment.to_string());
        scale.metadata.namespace = Some(self.namespace.clone());
        scale.metadata.resource_version = Some(resource_version.to_string());
        scale.spec = Some(ScaleSpec { replicas: Some(replicas) });
        self.state.lock().scales.insert(deployment.to_string(), scale);
    }

    pub fn scale(&self, deployment: &str) -> Option<Scale> { self.state.lock().scales.get(deployment).cloned() }

    /// Simulate another writer updating `deployment` right after the next scale read.
    pub fn race_next_scale_update(&self, deployment: &str) { self.state.lock().racing.insert(deployment.to_string()); }

    pub fn add_pod(&self, name: &str) { self.state.lock().pods.insert(name.to_string()); }

    pub fn deleted_pods(&self) -> Vec<String> { self.state.lock().deleted_pods.clone() }
}

fn bump_version(scale: &mut Scale) {
    let next = scale.metadata.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0) + 1;
    scale.metadata.resource_version = Some(next.to_string());
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn namespace(&self) -> &str { &self.namespace }

    async fn list(&self, kind: ResourceKind) -> Result<ListPage, ClusterError> {
        let mut st = self.state.lock();
        *st.list_calls.entry(kind).or_default() += 1;
        st.lists
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ClusterError::Transport(format!("no scripted list for {kind}"))))
    }

    async fn watch(&self, kind: ResourceKind, from: &WatchCursor) -> Result<DeltaStream, ClusterError> {
        let mut st = self.state.lock();
        st.watch_opens.entry(kind).or_default().push(from.clone());
        match st.watches.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(WatchScript::Fail(e)) => Err(e),
            Some(WatchScript::Stream(rx)) => {
                Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
            }
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn get_scale(&self, deployment: &str) -> Result<Scale, ClusterError> {
        let mut st = self.state.lock();
        let racing = st.racing.remove(deployment);
        let stored = st
            .scales
            .get_mut(deployment)
            .ok_or_else(|| ClusterError::NotFound(format!("deployments.apps \"{deployment}\" not found")))?;
        let read = stored.clone();
        if racing {
            bump_version(stored);
        }
        Ok(read)
    }

    async fn replace_scale(&self, deployment: &str, scale: &Scale) -> Result<Scale, ClusterError> {
        let mut st = self.state.lock();
        let stored = st
            .scales
            .get_mut(deployment)
            .ok_or_else(|| ClusterError::NotFound(format!("deployments.apps \"{deployment}\" not found")))?;
        if scale.metadata.resource_version != stored.metadata.resource_version {
            return Err(ClusterError::Conflict(format!(
                "Operation cannot be fulfilled on deployments.apps \"{deployment}\": the object has been modified"
            )));
        }
        stored.spec = scale.spec.clone();
        bump_version(stored);
        Ok(stored.clone())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let mut st = self.state.lock();
        if !st.pods.remove(name) {
            return Err(ClusterError::NotFound(format!("pods \"{name}\" not found")));
        }
        st.deleted_pods.push(name.to_string());
        Ok(())
    }
}
