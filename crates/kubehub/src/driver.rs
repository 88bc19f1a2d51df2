//! List-watch driver: one per resource kind, keeps a store current and emits change events.
//!
//! States: `Listing -> Watching -> (Reconnecting <-> Watching) -> Stopped`. An expired cursor
//! sends the driver back to `Listing`; the relist replaces the store wholesale and emits no
//! per-object events for the gap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kubelive_core::{normalize, ChangeType, EventSink, ObjectKey, RawChange, ResourceKind};
use kubelive_store::ResourceStore;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Backoff, ClusterClient, ClusterError, ListPage, WatchCursor, WatchDelta};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Drop `metadata.managedFields` before storing and broadcasting. Off by default so the
    /// broadcast `data` matches what the snapshot routes return.
    pub strip_managed_fields: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { backoff_initial: Duration::from_millis(500), backoff_max: Duration::from_secs(30), strip_managed_fields: false }
    }
}

impl WatchConfig {
    /// Defaults overridden by `KUBELIVE_WATCH_BACKOFF_MAX_SECS` and `KUBELIVE_STRIP_MANAGED_FIELDS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = std::env::var("KUBELIVE_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.backoff_max = Duration::from_secs(secs.max(1));
        }
        if std::env::var("KUBELIVE_STRIP_MANAGED_FIELDS").map(|v| v == "1" || v == "true").unwrap_or(false) {
            cfg.strip_managed_fields = true;
        }
        cfg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Listing,
    Watching,
    /// Watch ended; reopen from the cursor, after a backoff delay when it ended with an error.
    Reconnecting { after_error: bool },
    Stopped,
}

pub struct ListWatch {
    kind: ResourceKind,
    client: Arc<dyn ClusterClient>,
    store: Arc<ResourceStore>,
    sink: Arc<dyn EventSink>,
    config: WatchConfig,
    backoff: Backoff,
    state: DriverState,
    cursor: Option<WatchCursor>,
}

impl ListWatch {
    pub fn new(
        kind: ResourceKind,
        client: Arc<dyn ClusterClient>,
        store: Arc<ResourceStore>,
        sink: Arc<dyn EventSink>,
        config: WatchConfig,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self { kind, client, store, sink, config, backoff, state: DriverState::Listing, cursor: None }
    }

    pub fn kind(&self) -> ResourceKind { self.kind }
    pub fn cursor(&self) -> Option<&WatchCursor> { self.cursor.as_ref() }

    /// Seed the store from a full list and position the cursor; no per-object events.
    pub fn apply_list(&mut self, mut page: ListPage) {
        if self.config.strip_managed_fields {
            page.items.iter_mut().for_each(|o| o.strip_managed_fields());
        }
        page.items.retain(|o| o.kind() == self.kind);
        self.sink.synced(self.kind, &page.items);
        self.store.replace(page.items);
        self.cursor = Some(page.cursor);
        self.state = DriverState::Watching;
        self.backoff.reset();
        counter!("watch_relists_total", 1, "kind" => self.kind.plural());
    }

    /// Apply one delta to the store and publish the resulting change event.
    ///
    /// Returns the published change type; bookmarks, foreign kinds and nameless objects publish nothing.
    pub fn apply_delta(&mut self, delta: WatchDelta) -> Option<ChangeType> {
        if let Some(c) = delta.cursor() {
            self.cursor = Some(c);
        }
        let (raw, mut object) = match delta {
            WatchDelta::Added(o) => (RawChange::Added, o),
            WatchDelta::Modified(o) => (RawChange::Modified, o),
            WatchDelta::Deleted(o) => (RawChange::Deleted, o),
            WatchDelta::Bookmark(_) => return None,
        };
        if object.kind() != self.kind {
            warn!(kind = %self.kind, got = %object.kind(), "delta of unexpected kind ignored");
            return None;
        }
        if self.config.strip_managed_fields {
            object.strip_managed_fields();
        }
        let Some(key) = ObjectKey::of(&object) else {
            warn!(kind = %self.kind, "delta for object without name ignored");
            return None;
        };
        let prior = match raw {
            RawChange::Deleted => self.store.remove(&key),
            RawChange::Added | RawChange::Modified => self.store.put(key.clone(), object.clone()),
        };
        let event = normalize(self.kind, raw, prior, object);
        let change = event.change_type();
        debug!(key = %key, change = change.as_str(), "delta applied");
        counter!("watch_deltas_total", 1, "kind" => self.kind.plural(), "change" => change.as_str());
        self.sink.publish(event);
        Some(change)
    }

    /// Drive the state machine until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(kind = %self.kind, "driver started");
        loop {
            self.state = match self.state {
                DriverState::Listing => self.list_step(&cancel).await,
                DriverState::Watching => self.watch_step(&cancel).await,
                DriverState::Reconnecting { after_error } => self.reconnect_step(after_error, &cancel).await,
                DriverState::Stopped => break,
            };
        }
        info!(kind = %self.kind, objects = self.store.len(), "driver stopped");
    }

    async fn list_step(&mut self, cancel: &CancellationToken) -> DriverState {
        let t0 = Instant::now();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DriverState::Stopped,
            res = self.client.list(self.kind) => res,
        };
        match res {
            Ok(page) => {
                info!(kind = %self.kind, items = page.items.len(), cursor = %page.cursor, took_ms = %t0.elapsed().as_millis(), "list ok");
                self.apply_list(page);
                DriverState::Watching
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                warn!(kind = %self.kind, error = %e, retry_ms = %delay.as_millis(), "list failed");
                if pause(delay, cancel).await { DriverState::Listing } else { DriverState::Stopped }
            }
        }
    }

    async fn watch_step(&mut self, cancel: &CancellationToken) -> DriverState {
        let Some(cursor) = self.cursor.clone() else { return DriverState::Listing };
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DriverState::Stopped,
            res = self.client.watch(self.kind, &cursor) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(ClusterError::CursorExpired(msg)) => {
                info!(kind = %self.kind, cursor = %cursor, reason = %msg, "cursor expired on open; relisting");
                return DriverState::Listing;
            }
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "watch open failed");
                return DriverState::Reconnecting { after_error: true };
            }
        };
        debug!(kind = %self.kind, cursor = %cursor, "watch opened");
        let mut healthy = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return DriverState::Stopped,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    if !healthy {
                        self.backoff.reset();
                        healthy = true;
                    }
                    self.apply_delta(delta);
                }
                Some(Err(ClusterError::CursorExpired(msg))) => {
                    info!(kind = %self.kind, reason = %msg, "cursor expired mid-watch; relisting");
                    return DriverState::Listing;
                }
                Some(Err(e)) => {
                    warn!(kind = %self.kind, error = %e, "watch stream error");
                    return DriverState::Reconnecting { after_error: true };
                }
                None => {
                    debug!(kind = %self.kind, "watch stream ended");
                    return DriverState::Reconnecting { after_error: false };
                }
            }
        }
    }

    async fn reconnect_step(&mut self, after_error: bool, cancel: &CancellationToken) -> DriverState {
        counter!("watch_reconnects_total", 1, "kind" => self.kind.plural());
        if after_error {
            let delay = self.backoff.next_delay();
            debug!(kind = %self.kind, delay_ms = %delay.as_millis(), "reconnecting after backoff");
            if !pause(delay, cancel).await {
                return DriverState::Stopped;
            }
        }
        if cancel.is_cancelled() { DriverState::Stopped } else { DriverState::Watching }
    }
}

/// Sleep unless cancelled first; `false` means stop.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Running driver: signal it with `stop`, wait for it with `join`.
pub struct DriverHandle {
    kind: ResourceKind,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DriverHandle {
    pub fn kind(&self) -> ResourceKind { self.kind }

    pub fn stop(&self) { self.cancel.cancel(); }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(kind = %self.kind, error = %e, "driver task failed");
        }
    }

    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

/// Spawn `driver` under a child of `parent`; cancelling the parent stops it too.
pub fn spawn_driver(driver: ListWatch, parent: &CancellationToken) -> DriverHandle {
    let kind = driver.kind();
    let cancel = parent.child_token();
    let task = tokio::spawn(driver.run(cancel.clone()));
    DriverHandle { kind, cancel, task }
}

/// All drivers of the process under one root token.
pub struct DriverSet {
    root: CancellationToken,
    handles: Vec<DriverHandle>,
}

impl DriverSet {
    /// Start one driver per kind, all sharing `client` and `sink`.
    pub fn start(
        kinds: &[ResourceKind],
        client: Arc<dyn ClusterClient>,
        sink: Arc<dyn EventSink>,
        config: WatchConfig,
    ) -> Self {
        let root = CancellationToken::new();
        let mut handles = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let store = Arc::new(ResourceStore::new(kind));
            let driver = ListWatch::new(kind, Arc::clone(&client), store, Arc::clone(&sink), config.clone());
            handles.push(spawn_driver(driver, &root));
        }
        info!(drivers = handles.len(), ns = %client.namespace(), "drivers started");
        Self { root, handles }
    }

    /// Signal every driver, then wait for all of them.
    pub async fn shutdown(self) {
        self.root.cancel();
        futures::future::join_all(self.handles.into_iter().map(DriverHandle::join)).await;
        info!("drivers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use k8s_openapi::api::core::v1::Pod;
    use kubelive_core::{ChangeEvent, ResourceSnapshot};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<ChangeEvent>,
        synced: Mutex<Vec<(ResourceKind, usize)>>,
    }

    impl EventSink for Recorder {
        fn publish(&self, event: ChangeEvent) { let _ = self.tx.send(event); }
        fn synced(&self, kind: ResourceKind, items: &[ResourceSnapshot]) { self.synced.lock().push((kind, items.len())); }
    }

    fn pod(name: &str, rv: &str) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some(name.into());
        p.metadata.namespace = Some("default".into());
        p.metadata.resource_version = Some(rv.into());
        p
    }

    fn fast() -> WatchConfig {
        WatchConfig { backoff_initial: Duration::from_millis(5), backoff_max: Duration::from_millis(20), ..Default::default() }
    }

    struct Rig {
        cluster: Arc<FakeCluster>,
        recorder: Arc<Recorder>,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        store: Arc<ResourceStore>,
    }

    fn rig() -> Rig {
        let (tx, events) = mpsc::unbounded_channel();
        Rig {
            cluster: Arc::new(FakeCluster::new()),
            recorder: Arc::new(Recorder { tx, synced: Mutex::new(Vec::new()) }),
            events,
            store: Arc::new(ResourceStore::new(ResourceKind::Pods)),
        }
    }

    impl Rig {
        fn spawn(&self, cancel: &CancellationToken) -> DriverHandle {
            let driver = ListWatch::new(
                ResourceKind::Pods,
                self.cluster.clone(),
                self.store.clone(),
                self.recorder.clone(),
                fast(),
            );
            spawn_driver(driver, cancel)
        }

        async fn next_event(&mut self) -> ChangeEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("event in time")
                .expect("sink alive")
        }

        fn names(&self) -> Vec<String> { self.store.list().into_iter().map(|(k, _)| k.name).collect() }
    }

    #[tokio::test]
    async fn initial_list_fills_store_without_events() {
        let mut rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into(), pod("b", "2").into()], "10");
        let feed = rig.cluster.push_watch(ResourceKind::Pods);
        let root = CancellationToken::new();
        let handle = rig.spawn(&root);

        feed.modified(pod("a", "11"));
        let ev = rig.next_event().await;
        assert_eq!(ev.change_type(), ChangeType::Modified);
        assert_eq!(ev.previous().and_then(|o| o.resource_version()), Some("1"));
        assert_eq!(ev.current().and_then(|o| o.resource_version()), Some("11"));
        assert_eq!(rig.names(), vec!["a", "b"]);
        assert_eq!(rig.recorder.synced.lock().as_slice(), &[(ResourceKind::Pods, 2)]);

        handle.shutdown().await;
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn added_for_known_identity_is_reported_as_modified() {
        let mut rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into()], "10");
        let feed = rig.cluster.push_watch(ResourceKind::Pods);
        let handle = rig.spawn(&CancellationToken::new());

        feed.added(pod("a", "11"));
        feed.added(pod("c", "12"));
        assert_eq!(rig.next_event().await.change_type(), ChangeType::Modified);
        let ev = rig.next_event().await;
        assert_eq!(ev.change_type(), ChangeType::Added);
        assert_eq!(ev.object().name(), Some("c"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn delete_removes_and_carries_final_state() {
        let mut rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into(), pod("b", "2").into()], "10");
        let feed = rig.cluster.push_watch(ResourceKind::Pods);
        let handle = rig.spawn(&CancellationToken::new());

        feed.deleted(pod("b", "13"));
        let ev = rig.next_event().await;
        assert_eq!(ev.change_type(), ChangeType::Deleted);
        assert!(ev.current().is_none());
        assert_eq!(ev.object().name(), Some("b"));
        assert_eq!(rig.names(), vec!["a"]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn expired_cursor_relists_without_gap_events() {
        let mut rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into(), pod("b", "2").into()], "10");
        let first = rig.cluster.push_watch(ResourceKind::Pods);
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into(), pod("c", "15").into()], "20");
        let second = rig.cluster.push_watch(ResourceKind::Pods);
        let handle = rig.spawn(&CancellationToken::new());

        first.fail(ClusterError::CursorExpired("too old resource version".into()));
        second.added(pod("d", "21"));

        let ev = rig.next_event().await;
        assert_eq!(ev.change_type(), ChangeType::Added);
        assert_eq!(ev.object().name(), Some("d"));
        assert_eq!(rig.names(), vec!["a", "c", "d"]);
        assert_eq!(rig.cluster.list_calls(ResourceKind::Pods), 2);
        assert_eq!(
            rig.cluster.watch_opens(ResourceKind::Pods),
            vec![WatchCursor::new("10"), WatchCursor::new("20")]
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn clean_stream_end_resumes_from_last_cursor() {
        let mut rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![], "10");
        let first = rig.cluster.push_watch(ResourceKind::Pods);
        let second = rig.cluster.push_watch(ResourceKind::Pods);
        let handle = rig.spawn(&CancellationToken::new());

        first.added(pod("a", "11"));
        first.bookmark("17");
        first.close();
        second.added(pod("b", "18"));

        assert_eq!(rig.next_event().await.object().name(), Some("a"));
        assert_eq!(rig.next_event().await.object().name(), Some("b"));
        assert_eq!(rig.cluster.list_calls(ResourceKind::Pods), 1);
        assert_eq!(
            rig.cluster.watch_opens(ResourceKind::Pods),
            vec![WatchCursor::new("10"), WatchCursor::new("17")]
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_error_reconnects_without_relist() {
        let mut rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into()], "10");
        rig.cluster.push_watch_error(ResourceKind::Pods, ClusterError::Transport("connection reset".into()));
        let feed = rig.cluster.push_watch(ResourceKind::Pods);
        let handle = rig.spawn(&CancellationToken::new());

        feed.modified(pod("a", "12"));
        assert_eq!(rig.next_event().await.change_type(), ChangeType::Modified);
        assert_eq!(rig.cluster.list_calls(ResourceKind::Pods), 1);
        assert_eq!(rig.cluster.watch_opens(ResourceKind::Pods).len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_list_is_retried() {
        let mut rig = rig();
        rig.cluster.push_list_error(ResourceKind::Pods, ClusterError::Transport("refused".into()));
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into()], "10");
        let feed = rig.cluster.push_watch(ResourceKind::Pods);
        let handle = rig.spawn(&CancellationToken::new());

        feed.deleted(pod("a", "11"));
        assert_eq!(rig.next_event().await.change_type(), ChangeType::Deleted);
        assert_eq!(rig.cluster.list_calls(ResourceKind::Pods), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_driver() {
        let rig = rig();
        rig.cluster.push_list(ResourceKind::Pods, vec![], "10");
        let root = CancellationToken::new();
        let handle = rig.spawn(&root);
        root.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.join()).await.expect("driver stops");
    }

    #[tokio::test]
    async fn driver_set_shutdown_stops_every_kind() {
        let rig = rig();
        let kinds = [ResourceKind::Pods, ResourceKind::Deployments, ResourceKind::Services, ResourceKind::ConfigMaps];
        // pods and deployments reach Watching; services and configmaps sit in list retry.
        rig.cluster.push_list(ResourceKind::Pods, vec![pod("a", "1").into()], "10");
        let _pods = rig.cluster.push_watch(ResourceKind::Pods);
        rig.cluster.push_list(ResourceKind::Deployments, vec![], "10");
        let _deployments = rig.cluster.push_watch(ResourceKind::Deployments);
        rig.cluster.push_list_error(ResourceKind::Services, ClusterError::Transport("refused".into()));
        let set = DriverSet::start(&kinds, rig.cluster.clone(), rig.recorder.clone(), fast());

        let watching = async {
            while rig.cluster.watch_opens(ResourceKind::Pods).is_empty()
                || rig.cluster.watch_opens(ResourceKind::Deployments).is_empty()
                || rig.cluster.list_calls(ResourceKind::Services) < 2
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), watching).await.expect("drivers watching");

        tokio::time::timeout(Duration::from_secs(5), set.shutdown()).await.expect("every driver stops");
        let synced: Vec<_> = rig.recorder.synced.lock().iter().map(|(k, _)| *k).collect();
        assert!(synced.contains(&ResourceKind::Pods) && synced.contains(&ResourceKind::Deployments));
    }

    #[tokio::test]
    async fn managed_fields_are_kept_unless_stripping_is_enabled() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
        let with_fields = |name: &str| {
            let mut p = pod(name, "2");
            p.metadata.managed_fields = Some(vec![ManagedFieldsEntry { manager: Some("kubectl".into()), ..Default::default() }]);
            p
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Recorder { tx, synced: Mutex::new(Vec::new()) });
        let cluster: Arc<FakeCluster> = Arc::new(FakeCluster::new());
        let store = Arc::new(ResourceStore::new(ResourceKind::Pods));

        let mut keep = ListWatch::new(ResourceKind::Pods, cluster.clone(), store.clone(), sink.clone(), fast());
        keep.apply_delta(WatchDelta::Added(with_fields("a").into()));
        let ev = rx.try_recv().expect("event");
        assert!(ev.object().metadata().managed_fields.is_some());

        let strip = WatchConfig { strip_managed_fields: true, ..fast() };
        let mut lw = ListWatch::new(ResourceKind::Pods, cluster, store, sink, strip);
        lw.apply_delta(WatchDelta::Added(with_fields("b").into()));
        let ev = rx.try_recv().expect("event");
        assert!(ev.object().metadata().managed_fields.is_none());
    }

    #[test]
    fn foreign_kinds_and_bookmarks_publish_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Recorder { tx, synced: Mutex::new(Vec::new()) });
        let store = Arc::new(ResourceStore::new(ResourceKind::Pods));
        let mut lw = ListWatch::new(ResourceKind::Pods, Arc::new(FakeCluster::new()), store.clone(), sink, fast());

        let mut svc = k8s_openapi::api::core::v1::Service::default();
        svc.metadata.name = Some("web".into());
        assert_eq!(lw.apply_delta(WatchDelta::Added(svc.into())), None);
        assert_eq!(lw.apply_delta(WatchDelta::Bookmark(WatchCursor::new("99"))), None);
        assert_eq!(lw.cursor(), Some(&WatchCursor::new("99")));
        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
