//! Change events and the normalizer that produces them from raw watch notifications.

use serde::{Deserialize, Serialize};

use crate::{ResourceKind, ResourceSnapshot};

/// Notification type as reported by the watch stream, before looking at local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawChange {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeType::Added),
            "modified" => Some(ChangeType::Modified),
            "deleted" => Some(ChangeType::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added(ResourceSnapshot),
    Modified { old: ResourceSnapshot, new: ResourceSnapshot },
    /// Final state carried by the delete notification.
    Deleted(ResourceSnapshot),
}

/// Normalized notification for one delta of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ResourceKind,
    pub change: Change,
}

impl ChangeEvent {
    pub fn change_type(&self) -> ChangeType {
        match self.change {
            Change::Added(_) => ChangeType::Added,
            Change::Modified { .. } => ChangeType::Modified,
            Change::Deleted(_) => ChangeType::Deleted,
        }
    }

    /// Prior snapshot; present only for `Modified`.
    pub fn previous(&self) -> Option<&ResourceSnapshot> {
        match &self.change {
            Change::Modified { old, .. } => Some(old),
            _ => None,
        }
    }

    /// Current snapshot; absent only for `Deleted`.
    pub fn current(&self) -> Option<&ResourceSnapshot> {
        match &self.change {
            Change::Added(new) | Change::Modified { new, .. } => Some(new),
            Change::Deleted(_) => None,
        }
    }

    /// The object the event is about: current state, or the final state for deletions.
    pub fn object(&self) -> &ResourceSnapshot {
        match &self.change {
            Change::Added(o) | Change::Modified { new: o, .. } | Change::Deleted(o) => o,
        }
    }

    /// Wire type tag, e.g. `pods-added`.
    pub fn type_tag(&self) -> String { format!("{}-{}", self.kind.plural(), self.change_type().as_str()) }
}

/// Turn a raw notification plus the prior stored object (if any) into a change event.
///
/// Added/Modified are classified by whether the identity was already known, the way
/// an informer reports them: a known identity yields `Modified`, an unknown one `Added`.
pub fn normalize(
    kind: ResourceKind,
    raw: RawChange,
    prior: Option<ResourceSnapshot>,
    object: ResourceSnapshot,
) -> ChangeEvent {
    let change = match (raw, prior) {
        (RawChange::Deleted, _) => Change::Deleted(object),
        (RawChange::Added | RawChange::Modified, Some(old)) => Change::Modified { old, new: object },
        (RawChange::Added | RawChange::Modified, None) => Change::Added(object),
    };
    ChangeEvent { kind, change }
}
