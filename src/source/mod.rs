//! The watch-capable source store contract and its event types.

pub mod etcd;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// One node in the source's key space, as reported on events and gets.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
}

/// A raw watch event. `etcd_index` is the source's current horizon at the
/// time the event was delivered.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub action: String,
    pub node: Option<Node>,
    pub prev_node: Option<Node>,
    pub etcd_index: u64,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub node: Option<Node>,
    pub etcd_index: u64,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("etcd error {code}: {message}")]
    Api {
        code: u64,
        message: String,
        index: Option<u64>,
    },
}

impl SourceError {
    /// The current source index reported by the failure, when the error
    /// carried one. Watch failures against compacted indices do.
    pub fn current_index(&self) -> Option<u64> {
        match self {
            SourceError::Api { index, .. } => *index,
            _ => None,
        }
    }
}

/// A watch-capable ordered key/value source.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn get(
        &self,
        path: &str,
        recursive: bool,
        sorted: bool,
    ) -> Result<GetResponse, SourceError>;

    /// Streams events starting at `from_index` into `events` until the
    /// source fails or the receiver is dropped. A dropped receiver is a
    /// clean stop, not an error.
    async fn watch(
        &self,
        path: &str,
        from_index: u64,
        recursive: bool,
        events: mpsc::Sender<WatchEvent>,
    ) -> Result<(), SourceError>;
}

#[derive(Debug, Default, Deserialize)]
struct UidMetadata {
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Default, Deserialize)]
struct UidObject {
    #[serde(default)]
    metadata: UidMetadata,
}

/// Reads `metadata.uid` out of a JSON payload. `None` when the payload does
/// not parse or the field is absent; the caller degrades by skipping the UID
/// index for that event.
pub fn extract_uid(value: &[u8]) -> Option<String> {
    let obj: UidObject = serde_json::from_slice(value).ok()?;
    if obj.metadata.uid.is_empty() {
        None
    } else {
        Some(obj.metadata.uid)
    }
}
