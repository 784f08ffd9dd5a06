use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-document index of the latest locally-applied mutation, keyed by
/// document. Avoids replaying the whole mutation log on every read.
#[derive(Debug, Default)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlays_by_batch: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl DocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(overlays: Vec<Overlay>) -> Self {
        let mut cache = Self::default();
        for overlay in overlays {
            cache.insert(overlay);
        }
        cache
    }

    pub fn overlay_for(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.overlays.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    /// Stores the folded overlays produced while applying `batch_id`.
    pub fn save_overlays(&mut self, batch_id: i32, overlays: BTreeMap<DocumentKey, Mutation>) {
        for (_, mutation) in overlays {
            self.insert(Overlay::new(batch_id, mutation));
        }
    }

    fn insert(&mut self, overlay: Overlay) {
        let key = overlay.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            if let Some(keys) = self.overlays_by_batch.get_mut(&existing.largest_batch_id()) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.overlays_by_batch.remove(&existing.largest_batch_id());
                }
            }
        }
        self.overlays_by_batch
            .entry(overlay.largest_batch_id())
            .or_default()
            .insert(key.clone());
        self.overlays.insert(key, overlay);
    }

    pub fn remove_overlay(&mut self, key: &DocumentKey) -> Option<Overlay> {
        let overlay = self.overlays.remove(key)?;
        if let Some(keys) = self.overlays_by_batch.get_mut(&overlay.largest_batch_id()) {
            keys.remove(key);
            if keys.is_empty() {
                self.overlays_by_batch.remove(&overlay.largest_batch_id());
            }
        }
        Some(overlay)
    }

    /// Drops every overlay whose newest contributing batch is `batch_id`,
    /// returning the affected keys so they can be recomputed from the
    /// remaining queue.
    pub fn remove_overlays_for_batch(&mut self, batch_id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.overlays_by_batch.remove(&batch_id).unwrap_or_default();
        for key in &keys {
            self.overlays.remove(key);
        }
        keys
    }

    /// Overlays in `collection` contributed by batches newer than
    /// `since_batch_id`, used to re-derive limited query windows without a
    /// full remote-cache scan.
    pub fn overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, &Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                overlay.largest_batch_id() > since_batch_id
                    && key.collection_path() == *collection
            })
            .map(|(key, overlay)| (key.clone(), overlay))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set_overlay(path: &str) -> Mutation {
        Mutation::set(key(path), MapValue::empty())
    }

    #[test]
    fn replacing_overlay_reindexes_batch() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(1, [(key("bookings/a"), set_overlay("bookings/a"))].into());
        cache.save_overlays(2, [(key("bookings/a"), set_overlay("bookings/a"))].into());

        assert!(cache.remove_overlays_for_batch(1).is_empty());
        let removed = cache.remove_overlays_for_batch(2);
        assert!(removed.contains(&key("bookings/a")));
        assert!(cache.overlay_for(&key("bookings/a")).is_none());
    }

    #[test]
    fn collection_scan_respects_since_batch() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(1, [(key("bookings/a"), set_overlay("bookings/a"))].into());
        cache.save_overlays(3, [(key("bookings/b"), set_overlay("bookings/b"))].into());
        cache.save_overlays(2, [(key("stations/s"), set_overlay("stations/s"))].into());

        let collection = ResourcePath::from_string("bookings").unwrap();
        let recent = cache.overlays_for_collection(&collection, 1);
        assert_eq!(recent.len(), 1);
        assert!(recent.contains_key(&key("bookings/b")));
    }
}
