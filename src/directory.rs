//! Channel directory: the gateway's view of the upstream lineup.
//!
//! The directory is rebuilt wholesale by the scheduled lineup refresh and
//! read concurrently by every in-flight request. Refresh builds a complete
//! new map off to the side, then swaps the shared reference in a single
//! write, so readers always see either the old or the new snapshot and
//! never a half-updated one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Where a channel's live stream comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// The stream must be requested from the upstream receiver before a
    /// playable URL is known (two-phase watch request).
    DeviceHosted,
    /// The locator already is the playable URL (e.g. a FAST channel).
    DirectUrl,
}

/// One entry in the channel lineup. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Upstream channel identifier, also the path segment in `/channel/{id}`.
    pub id: String,
    /// Guide number shown to Plex (e.g. "5.1" or "1002").
    pub display_number: String,
    /// Guide name shown to Plex.
    pub display_name: String,
    /// Source flavor.
    pub source: SourceKind,
    /// Channel id for device-hosted channels, full URL for direct ones.
    pub locator: String,
}

/// Snapshot type handed out to readers.
pub type DirectorySnapshot = Arc<HashMap<String, ChannelDescriptor>>;

/// Concurrently readable channel directory with swap-on-refresh updates.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    channels: RwLock<DirectorySnapshot>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current snapshot. Cheap: clones an `Arc`.
    pub async fn snapshot(&self) -> DirectorySnapshot {
        Arc::clone(&*self.channels.read().await)
    }

    /// Look up a single channel in the current snapshot.
    pub async fn get(&self, id: &str) -> Option<ChannelDescriptor> {
        self.channels.read().await.get(id).cloned()
    }

    /// Atomically replace the directory with a freshly built lineup.
    ///
    /// Callers build the complete map first; a failed refresh never gets
    /// this far, which leaves the previous snapshot in place.
    pub async fn replace(&self, channels: HashMap<String, ChannelDescriptor>) {
        let count = channels.len();
        *self.channels.write().await = Arc::new(channels);
        log::info!("Channel directory updated: {} channels", count);
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, number: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            id: id.to_string(),
            display_number: number.to_string(),
            display_name: format!("Channel {}", number),
            source: SourceKind::DeviceHosted,
            locator: id.to_string(),
        }
    }

    #[tokio::test]
    async fn replace_swaps_whole_snapshot() {
        let dir = ChannelDirectory::new();
        assert!(dir.is_empty().await);

        let mut first = HashMap::new();
        first.insert("a".to_string(), descriptor("a", "2.1"));
        dir.replace(first).await;
        assert_eq!(dir.len().await, 1);

        // A reader holding the old snapshot keeps seeing it after a swap.
        let old = dir.snapshot().await;

        let mut second = HashMap::new();
        second.insert("b".to_string(), descriptor("b", "4.1"));
        second.insert("c".to_string(), descriptor("c", "5.1"));
        dir.replace(second).await;

        assert_eq!(old.len(), 1);
        assert!(old.contains_key("a"));
        assert_eq!(dir.len().await, 2);
        assert!(dir.get("a").await.is_none());
        assert_eq!(dir.get("b").await.unwrap().display_number, "4.1");
    }
}
