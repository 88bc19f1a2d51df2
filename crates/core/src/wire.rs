//! Wire envelope for broadcast messages: `{"type": "<kind>-<change>", "data": ...}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::event::{Change, ChangeEvent, ChangeType};
use crate::{ResourceKind, ResourceSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encoding envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("modified payload missing {0}")]
    MissingField(&'static str),
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    #[serde(rename = "type")]
    ty: String,
    data: T,
}

#[derive(Serialize)]
struct ModifiedData<'a> {
    #[serde(rename = "New")]
    new: &'a ResourceSnapshot,
    #[serde(rename = "Old")]
    old: &'a ResourceSnapshot,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    ty: String,
    data: serde_json::Value,
}

/// Serialize a change event into its wire bytes.
pub fn encode_event(event: &ChangeEvent) -> Result<Bytes, WireError> {
    let ty = event.type_tag();
    let bytes = match &event.change {
        Change::Added(obj) | Change::Deleted(obj) => serde_json::to_vec(&Envelope { ty, data: obj }),
        Change::Modified { old, new } => serde_json::to_vec(&Envelope { ty, data: ModifiedData { new, old } }),
    }
    .map_err(WireError::Encode)?;
    Ok(Bytes::from(bytes))
}

/// Serialize a full-list announcement: `{"type": "<kind>-synced", "data": [...]}`.
pub fn encode_synced(kind: ResourceKind, items: &[ResourceSnapshot]) -> Result<Bytes, WireError> {
    let env = Envelope { ty: format!("{}-synced", kind.plural()), data: items };
    serde_json::to_vec(&env).map(Bytes::from).map_err(WireError::Encode)
}

/// Parse wire bytes back into a change event.
pub fn decode_envelope(bytes: &[u8]) -> Result<ChangeEvent, WireError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(WireError::Malformed)?;
    let (kind, change_type) = raw
        .ty
        .rsplit_once('-')
        .and_then(|(k, c)| Some((k.parse::<ResourceKind>().ok()?, ChangeType::parse(c)?)))
        .ok_or_else(|| WireError::UnknownType(raw.ty.clone()))?;
    let decode = |v: serde_json::Value| ResourceSnapshot::from_value(kind, v).map_err(WireError::Malformed);
    let change = match change_type {
        ChangeType::Added => Change::Added(decode(raw.data)?),
        ChangeType::Deleted => Change::Deleted(decode(raw.data)?),
        ChangeType::Modified => {
            let mut data = raw.data;
            let new = data.get_mut("New").map(serde_json::Value::take).ok_or(WireError::MissingField("New"))?;
            let old = data.get_mut("Old").map(serde_json::Value::take).ok_or(WireError::MissingField("Old"))?;
            Change::Modified { old: decode(old)?, new: decode(new)? }
        }
    };
    Ok(ChangeEvent { kind, change })
}
