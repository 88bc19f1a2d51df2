//! Broadcast hub: one bounded queue per subscriber, fed by every published change event.
//!
//! `publish` never waits on a subscriber. A queue that is full or whose receiver is gone gets
//! its subscriber detached on the spot, so fast subscribers are never held back by slow ones.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use kubelive_core::{encode_event, encode_synced, ChangeEvent, EventSink, ResourceKind, ResourceSnapshot};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 1024;

/// One outbound message, kept as the frame type it will be sent as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
}

impl Frame {
    pub fn payload(&self) -> &Bytes {
        match self {
            Frame::Text(b) | Frame::Binary(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "sub-{}", self.0) }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub max_subscribers: usize,
    /// Send a `<kind>-synced` frame with the full list after every (re)list.
    pub announce_sync: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { queue_capacity: DEFAULT_QUEUE_CAPACITY, max_subscribers: DEFAULT_MAX_SUBSCRIBERS, announce_sync: false }
    }
}

impl HubConfig {
    /// Defaults overridden by `KUBELIVE_QUEUE_CAP` and `KUBELIVE_MAX_SUBSCRIBERS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_usize("KUBELIVE_QUEUE_CAP") {
            cfg.queue_capacity = n.max(1);
        }
        if let Some(n) = env_usize("KUBELIVE_MAX_SUBSCRIBERS") {
            cfg.max_subscribers = n;
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> { std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()) }

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("subscriber limit reached ({current}/{max})")]
    TooManySubscribers { current: usize, max: usize },
    #[error("hub is shut down")]
    Closed,
}

/// Receiving end handed to a connection; frames arrive in publish order.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Frame>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId { self.id }

    /// Next frame; `None` once the hub detached this subscriber.
    pub async fn recv(&mut self) -> Option<Frame> { self.rx.recv().await }

    pub fn try_recv(&mut self) -> Option<Frame> { self.rx.try_recv().ok() }
}

#[derive(Default)]
struct HubInner {
    subscribers: FxHashMap<SubscriberId, mpsc::Sender<Frame>>,
    closed: bool,
}

pub struct Hub {
    config: HubConfig,
    inner: RwLock<HubInner>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self { Self { config, inner: RwLock::new(HubInner::default()), next_id: AtomicU64::new(1) } }

    /// Register a subscriber with the configured queue capacity.
    pub fn attach(&self) -> Result<Subscription, HubError> { self.attach_with_capacity(self.config.queue_capacity) }

    /// Register a subscriber; it receives every frame published after this returns.
    pub fn attach_with_capacity(&self, capacity: usize) -> Result<Subscription, HubError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(HubError::Closed);
        }
        let current = inner.subscribers.len();
        if current >= self.config.max_subscribers {
            return Err(HubError::TooManySubscribers { current, max: self.config.max_subscribers });
        }
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        inner.subscribers.insert(id, tx);
        let n = inner.subscribers.len();
        drop(inner);
        gauge!("hub_subscribers", n as f64);
        debug!(subscriber = %id, subscribers = n, "subscriber attached");
        Ok(Subscription { id, rx })
    }

    /// Remove a subscriber and close its queue. Unknown ids are ignored.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.subscribers.remove(&id).is_some();
        let n = inner.subscribers.len();
        drop(inner);
        if removed {
            gauge!("hub_subscribers", n as f64);
            debug!(subscriber = %id, subscribers = n, "subscriber detached");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize { self.inner.read().subscribers.len() }

    #[cfg(test)]
    fn is_attached(&self, id: SubscriberId) -> bool { self.inner.read().subscribers.contains_key(&id) }

    /// Encode `event` once and queue it for every subscriber. Returns the number it reached.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        match encode_event(event) {
            Ok(bytes) => self.broadcast(Frame::Text(bytes)),
            Err(e) => {
                counter!("hub_encode_failures_total", 1);
                warn!(kind = %event.kind, change = event.change_type().as_str(), error = %e, "event dropped: encode failed");
                0
            }
        }
    }

    /// Queue `frame` for every subscriber, detaching those that cannot take it.
    pub fn broadcast(&self, frame: Frame) -> usize {
        let mut dropped = Vec::new();
        let mut delivered = 0usize;
        {
            let inner = self.inner.read();
            for (id, tx) in inner.subscribers.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => dropped.push((*id, "queue full")),
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push((*id, "receiver gone")),
                }
            }
        }
        counter!("hub_frames_total", 1);
        if !dropped.is_empty() {
            let mut inner = self.inner.write();
            for (id, reason) in &dropped {
                if inner.subscribers.remove(id).is_some() {
                    info!(subscriber = %id, reason, "subscriber dropped");
                }
            }
            let n = inner.subscribers.len();
            drop(inner);
            counter!("hub_dropped_subscribers_total", dropped.len() as u64);
            gauge!("hub_subscribers", n as f64);
        }
        delivered
    }

    /// Detach every subscriber and refuse new ones.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        let n = inner.subscribers.len();
        inner.subscribers.clear();
        drop(inner);
        gauge!("hub_subscribers", 0.0);
        info!(detached = n, "hub shut down");
    }
}

impl EventSink for Hub {
    fn publish(&self, event: ChangeEvent) { Hub::publish(self, &event); }

    fn synced(&self, kind: ResourceKind, items: &[ResourceSnapshot]) {
        if !self.config.announce_sync {
            return;
        }
        match encode_synced(kind, items) {
            Ok(bytes) => {
                self.broadcast(Frame::Text(bytes));
            }
            Err(e) => {
                counter!("hub_encode_failures_total", 1);
                warn!(kind = %kind, error = %e, "sync announcement dropped: encode failed");
            }
        }
    }
}
