//! Pending friend requests for accounts that are currently offline.
//!
//! Two mirrored maps: what each sender still has outstanding (so senders
//! cannot flood the store) and what each recipient will be handed on their
//! next connect. Both sides are bounded with oldest-first eviction, and an
//! eviction on either side removes its mirror entry on the other. The whole
//! evict-then-insert sequence runs under one lock so the mirrors never
//! disagree.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use uuid::Uuid;

/// Outstanding requests one account may have stored towards others.
pub const REMEMBERED_LIMIT: usize = 5;

/// Stored requests one offline account may accumulate from others.
pub const RECEIVED_LIMIT: usize = 10;

/// Insertion-ordered pending map. Values per key are unique; exceeding the
/// limit drops the oldest value and reports it.
#[derive(Default)]
struct PendingMap {
    entries: HashMap<Uuid, VecDeque<Uuid>>,
}

impl PendingMap {
    /// Adds `value` under `key`. Re-adding an existing value neither moves
    /// nor evicts anything.
    fn add(&mut self, key: Uuid, value: Uuid, limit: usize) -> Option<Uuid> {
        let values = self.entries.entry(key).or_default();
        if values.contains(&value) {
            return None;
        }
        values.push_back(value);
        if values.len() > limit {
            values.pop_front()
        } else {
            None
        }
    }

    fn remove_value(&mut self, key: Uuid, value: Uuid) {
        if let Some(values) = self.entries.get_mut(&key) {
            values.retain(|existing| *existing != value);
            if values.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn take(&mut self, key: Uuid) -> Vec<Uuid> {
        self.entries.remove(&key).map(Vec::from).unwrap_or_default()
    }

    fn values(&self, key: Uuid) -> Vec<Uuid> {
        self.entries
            .get(&key)
            .map(|values| values.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Mirrors {
    /// sender → recipients still stored on their behalf.
    remembered: PendingMap,
    /// recipient → senders waiting for them to connect.
    received: PendingMap,
}

/// Store of friend requests awaiting redelivery.
#[derive(Default)]
pub struct FriendRequestStore {
    inner: Mutex<Mirrors>,
}

impl FriendRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `sender` asked to friend the offline `recipient`.
    pub async fn store_pending(&self, sender: Uuid, recipient: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(dropped_recipient) =
            inner.remembered.add(sender, recipient, REMEMBERED_LIMIT)
        {
            inner.received.remove_value(dropped_recipient, sender);
        }
        if let Some(dropped_sender) = inner.received.add(recipient, sender, RECEIVED_LIMIT) {
            inner.remembered.remove_value(dropped_sender, recipient);
        }
    }

    /// Hands out everything stored for a connecting `recipient`, oldest
    /// first, and clears the sender-side mirrors.
    pub async fn take_received(&self, recipient: Uuid) -> Vec<Uuid> {
        let mut inner = self.inner.lock().await;
        let senders = inner.received.take(recipient);
        for sender in &senders {
            inner.remembered.remove_value(*sender, recipient);
        }
        senders
    }

    #[cfg(test)]
    async fn remembered_for(&self, sender: Uuid) -> Vec<Uuid> {
        self.inner.lock().await.remembered.values(sender)
    }

    #[cfg(test)]
    async fn received_for(&self, recipient: Uuid) -> Vec<Uuid> {
        self.inner.lock().await.received.values(recipient)
    }
}
