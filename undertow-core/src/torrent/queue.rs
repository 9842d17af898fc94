//! Ordered set of live torrents keyed by info hash.

use std::sync::Arc;

use parking_lot::Mutex;

use super::InfoHash;

/// Anything the queue can key by info hash.
pub trait QueueItem: Send + Sync {
    fn info_hash(&self) -> InfoHash;
}

/// Insertion-ordered collection with unique info hashes.
///
/// All operations take the same mutex; `all` returns a snapshot that stays
/// valid while other tasks mutate the queue.
pub struct Queue<T: QueueItem> {
    items: Mutex<Vec<Arc<T>>>,
}

impl<T: QueueItem> Queue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Appends `item`. Returns false when its info hash is already queued.
    pub fn add(&self, item: Arc<T>) -> bool {
        let mut items = self.items.lock();
        let info_hash = item.info_hash();
        if items.iter().any(|existing| existing.info_hash() == info_hash) {
            return false;
        }
        items.push(item);
        true
    }

    /// Removes and returns the item with `info_hash`.
    pub fn delete(&self, info_hash: &InfoHash) -> Option<Arc<T>> {
        let mut items = self.items.lock();
        let position = items
            .iter()
            .position(|item| item.info_hash() == *info_hash)?;
        Some(items.remove(position))
    }

    pub fn find_by_hash(&self, info_hash: &InfoHash) -> Option<Arc<T>> {
        self.items
            .lock()
            .iter()
            .find(|item| item.info_hash() == *info_hash)
            .cloned()
    }

    /// Snapshot in insertion order.
    pub fn all(&self) -> Vec<Arc<T>> {
        self.items.lock().clone()
    }

    /// Empties the queue and returns what it held.
    pub fn clean(&self) -> Vec<Arc<T>> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: QueueItem> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
