//! Listing-stale notifications emitted after successful mutations.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Which mutation made an owner's listings stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    Created,
    Starred,
    Trashed,
    Renamed,
    Moved,
    Deleted,
    TrashEmptied,
    /// The subscriber fell behind and missed signals; re-query everything.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingStale {
    pub owner_id: String,
    pub reason: StaleReason,
    /// Absent for owner-wide changes such as emptying the trash.
    #[serde(default)]
    pub entry_id: Option<Uuid>,
}

/// Fan-out of `ListingStale` signals. Subscribers filter by owner themselves; a send with
/// nobody listening is not an error.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ListingStale>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListingStale> {
        self.tx.subscribe()
    }

    pub fn publish(&self, owner_id: &str, reason: StaleReason, entry_id: Option<Uuid>) {
        let _ = self.tx.send(ListingStale { owner_id: owner_id.to_string(), reason, entry_id });
    }
}

impl Default for ChangeFeed {
    fn default() -> Self { Self::new(256) }
}
