//! Last-sample slot shared between the serializer and out-of-band readers.
//!
//! The serializer publishes every sample it processes; diagnostic surfaces
//! (status endpoints, crash dumps) read whatever was published most recently.
//! The slot is an explicit handle passed to whoever needs it at construction
//! time, not a process-wide singleton.

use std::sync::Arc;

use parking_lot::RwLock;

pub struct MetricStore<T> {
    slot: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> Clone for MetricStore<T> {
    fn clone(&self) -> Self {
        MetricStore {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for MetricStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MetricStore<T> {
    pub fn new() -> Self {
        MetricStore {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Publishes `sample` (or clears the slot with `None`).
    pub fn store(&self, sample: Option<Arc<T>>) {
        *self.slot.write() = sample;
    }

    /// Takes a snapshot reference to the most recently published sample.
    pub fn load(&self) -> Option<Arc<T>> {
        self.slot.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_returns_the_stored_sample() {
        let store = MetricStore::new();
        store.store(Some(Arc::new(7_u32)));

        assert_eq!(store.load().as_deref(), Some(&7));
    }

    #[test]
    fn store_none_clears_the_slot() {
        let store = MetricStore::new();
        store.store(Some(Arc::new(7_u32)));

        store.store(None);

        assert!(store.load().is_none());
    }

    #[test]
    fn clones_share_the_same_slot() {
        let store = MetricStore::new();
        let reader = store.clone();

        store.store(Some(Arc::new("sample")));

        assert_eq!(reader.load().as_deref(), Some(&"sample"));
    }
}
