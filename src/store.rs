//! Last-value-per-key message store backing stateful channels.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::message::Message;

/// Keyed last-value cache for one channel.
///
/// Set-or-update is atomic per key and preserves the insertion order of a
/// key's first appearance. `snapshot` clones the ordered values under a
/// brief read section; it is weakly consistent with respect to writers
/// that start after the snapshot begins, which is what the
/// subscribe-with-state handoff pairs with a live tail.
pub struct MessageStore<T> {
    entries: RwLock<IndexMap<Arc<str>, Message<T>>>,
}

impl<T> Default for MessageStore<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }
}

impl<T: Clone> MessageStore<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores the envelope under its key, replacing any prior value. The
    /// key's position in the snapshot order is fixed by its first
    /// appearance.
    pub(crate) fn set(&self, key: Arc<str>, message: Message<T>) {
        self.entries.write().insert(key, message);
    }

    pub fn try_get(&self, key: &str) -> Option<Message<T>> {
        self.entries.read().get(key).cloned()
    }

    /// Removes the key, keeping the relative order of the remaining
    /// entries.
    pub fn try_delete(&self, key: &str) -> bool {
        self.entries.write().shift_remove(key).is_some()
    }

    /// Clears every key, returning how many were dropped.
    pub fn reset(&self) -> usize {
        let mut entries = self.entries.write();
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    /// Point-in-time ordered view of the stored envelopes.
    pub fn snapshot(&self) -> Vec<Message<T>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64, key: &str, body: i64) -> Message<i64> {
        Message {
            id,
            timestamp: 0,
            inception: 0,
            correlation_id: 0,
            key: Some(Arc::from(key)),
            from: None,
            tag_a: 0,
            body,
        }
    }

    fn set(store: &MessageStore<i64>, id: u64, key: &str, body: i64) {
        store.set(Arc::from(key), message(id, key, body));
    }

    #[test]
    fn last_value_wins_keeping_first_appearance_order() {
        let store = MessageStore::new();
        set(&store, 1, "a", 10);
        set(&store, 2, "b", 20);
        set(&store, 3, "a", 11);
        set(&store, 4, "c", 30);

        let bodies: Vec<_> = store.snapshot().iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![11, 20, 30]);
        assert_eq!(store.try_get("a").expect("key a").id, 3);
    }

    #[test]
    fn delete_preserves_remaining_order() {
        let store = MessageStore::new();
        set(&store, 1, "a", 1);
        set(&store, 2, "b", 2);
        set(&store, 3, "c", 3);

        assert!(store.try_delete("b"));
        assert!(!store.try_delete("b"));
        let bodies: Vec<_> = store.snapshot().iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![1, 3]);
    }

    #[test]
    fn reset_reports_cleared_count() {
        let store = MessageStore::new();
        set(&store, 1, "a", 1);
        set(&store, 2, "b", 2);
        assert_eq!(store.reset(), 2);
        assert!(store.is_empty());
        assert_eq!(store.reset(), 0);
    }
}
