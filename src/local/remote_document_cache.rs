use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MutableDocument, Timestamp};
use crate::query::Query;

/// Durable cache of the last known server-confirmed state of each document.
#[derive(Debug, Default)]
pub struct RemoteDocumentCache {
    entries: BTreeMap<DocumentKey, MutableDocument>,
    latest_read_time: Timestamp,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(documents: BTreeMap<DocumentKey, MutableDocument>) -> Self {
        let latest_read_time = documents
            .values()
            .map(MutableDocument::read_time)
            .max()
            .unwrap_or(Timestamp::ZERO);
        Self {
            entries: documents,
            latest_read_time,
        }
    }

    /// Always yields a document; cache misses produce the invalid
    /// placeholder so callers can layer overlays without special cases.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    pub fn get_all(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter().map(|key| (key.clone(), self.get(key))).collect()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn add(&mut self, mut doc: MutableDocument, read_time: Timestamp) {
        doc.set_read_time(read_time);
        if read_time > self.latest_read_time {
            self.latest_read_time = read_time;
        }
        self.entries.insert(doc.key().clone(), doc);
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest_read_time(&self) -> Timestamp {
        self.latest_read_time
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.entries.keys()
    }

    /// Full scan of the documents that could match `query`'s path, counting
    /// reads into `scanned` for the index heuristics.
    pub fn documents_matching_path(
        &self,
        query: &Query,
        scanned: &mut usize,
    ) -> Vec<MutableDocument> {
        self.entries
            .values()
            .filter(|doc| {
                let in_scope = match query.collection_group_id() {
                    Some(group) => doc.key().collection_id() == group,
                    None => doc.key().collection_path() == *query.path(),
                };
                if in_scope {
                    *scanned += 1;
                }
                in_scope
            })
            .cloned()
            .collect()
    }

    /// Documents whose cache read time is strictly newer than `read_time`.
    pub fn documents_changed_since(&self, read_time: Timestamp) -> Vec<MutableDocument> {
        self.entries
            .values()
            .filter(|doc| doc.read_time() > read_time)
            .cloned()
            .collect()
    }
}
