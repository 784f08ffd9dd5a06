use std::collections::{BTreeMap, BTreeSet};

use crate::local::local_documents::{get_document, overlay_documents_for_query};
use crate::local::overlay_cache::DocumentOverlayCache;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetState;
use crate::model::{DocumentKey, MutableDocument};
use crate::query::Query;

/// Policy knobs for the index-worthiness heuristic. These are tuning
/// constants, not correctness requirements.
#[derive(Clone, Copy, Debug)]
pub struct QueryEngineConfig {
    /// Full scans smaller than this never justify an index.
    pub min_collection_size: usize,
    /// An index is scheduled when a full scan reads more than
    /// `returned * relative_index_read_cost` documents.
    pub relative_index_read_cost: f64,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            min_collection_size: 100,
            relative_index_read_cost: 2.0,
        }
    }
}

/// Maintained key sets for query shapes the heuristic promoted.
#[derive(Default)]
pub struct IndexManager {
    entries: BTreeMap<String, IndexEntry>,
}

struct IndexEntry {
    query: Query,
    keys: BTreeSet<DocumentKey>,
}

impl IndexManager {
    pub fn keys_for(&self, query: &Query) -> Option<&BTreeSet<DocumentKey>> {
        self.entries.get(&query.canonical_id()).map(|e| &e.keys)
    }

    pub fn register(&mut self, query: Query, keys: BTreeSet<DocumentKey>) {
        self.entries
            .insert(query.canonical_id(), IndexEntry { query, keys });
    }

    /// Keeps every maintained index consistent with a batch of changed
    /// server-confirmed documents.
    pub fn update_entries<'a>(&mut self, docs: impl IntoIterator<Item = &'a MutableDocument>) {
        for doc in docs {
            for entry in self.entries.values_mut() {
                if entry.query.matches(doc) {
                    entry.keys.insert(doc.key().clone());
                } else {
                    entry.keys.remove(doc.key());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Chooses and runs a query execution strategy against the local caches.
pub struct QueryEngine {
    config: QueryEngineConfig,
    index_manager: IndexManager,
}

impl QueryEngine {
    pub fn new(config: QueryEngineConfig) -> Self {
        Self {
            config,
            index_manager: IndexManager::default(),
        }
    }

    pub fn index_manager_mut(&mut self) -> &mut IndexManager {
        &mut self.index_manager
    }

    /// Executes `query`, preferring (in order) a maintained index, an
    /// incremental scan keyed to the target's last limbo-free snapshot, and
    /// a full collection scan.
    pub fn execute(
        &mut self,
        remote: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        query: &Query,
        target_state: Option<&TargetState>,
    ) -> Vec<MutableDocument> {
        if let Some(keys) = self.index_manager.keys_for(query) {
            let keys = keys.clone();
            log::debug!("query {} served from index", query.canonical_id());
            return self.execute_over_keys(remote, overlays, query, &keys);
        }

        if let Some(state) = target_state {
            if !state.last_limbo_free_snapshot_version.is_zero() {
                if let Some(result) = self.execute_incremental(remote, overlays, query, state) {
                    return result;
                }
            }
        }

        self.execute_full_scan(remote, overlays, query)
    }

    fn execute_over_keys(
        &self,
        remote: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        query: &Query,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutableDocument> {
        let mut candidates: BTreeMap<DocumentKey, MutableDocument> = keys
            .iter()
            .map(|key| (key.clone(), get_document(remote, overlays, key)))
            .collect();
        candidates.extend(overlay_documents_for_query(remote, overlays, query));
        finish(query, candidates)
    }

    /// Re-derives the result from the target's previously synced key set
    /// plus documents changed since the last limbo-free snapshot. Returns
    /// `None` when a limited result set would be ambiguous, forcing the
    /// caller onto the full scan.
    fn execute_incremental(
        &self,
        remote: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        query: &Query,
        state: &TargetState,
    ) -> Option<Vec<MutableDocument>> {
        let previous: BTreeMap<DocumentKey, MutableDocument> = state
            .remote_keys
            .iter()
            .map(|key| (key.clone(), get_document(remote, overlays, key)))
            .filter(|(_, doc)| query.matches(doc))
            .collect();

        if let Some(limit) = query.limit() {
            if previous.len() < limit as usize {
                return None;
            }
            // A limited window is only trustworthy if its boundary document
            // did not move since the snapshot the key set was taken at.
            let exec = query.as_limit_to_first_for_server();
            let mut sorted: Vec<&MutableDocument> = previous.values().collect();
            sorted.sort_by(|a, b| exec.comparator(a, b));
            if let Some(boundary) = sorted.get(limit as usize - 1) {
                if boundary.has_pending_writes()
                    || boundary.version() > state.last_limbo_free_snapshot_version
                {
                    return None;
                }
            }
        }

        log::debug!(
            "query {} executed incrementally over {} previous keys",
            query.canonical_id(),
            previous.len()
        );

        let mut candidates = previous;
        for doc in remote.documents_changed_since(state.last_limbo_free_snapshot_version) {
            candidates.insert(doc.key().clone(), get_document(remote, overlays, doc.key()));
        }
        candidates.extend(overlay_documents_for_query(remote, overlays, query));
        Some(finish(query, candidates))
    }

    fn execute_full_scan(
        &mut self,
        remote: &RemoteDocumentCache,
        overlays: &DocumentOverlayCache,
        query: &Query,
    ) -> Vec<MutableDocument> {
        let mut scanned = 0usize;
        let mut candidates: BTreeMap<DocumentKey, MutableDocument> = remote
            .documents_matching_path(query, &mut scanned)
            .into_iter()
            .map(|doc| {
                let key = doc.key().clone();
                (key.clone(), get_document(remote, overlays, &key))
            })
            .collect();
        candidates.extend(overlay_documents_for_query(remote, overlays, query));
        let result = finish(query, candidates);

        if scanned >= self.config.min_collection_size
            && scanned as f64 > result.len() as f64 * self.config.relative_index_read_cost
        {
            let keys = result
                .iter()
                .filter(|doc| !doc.has_pending_writes())
                .map(|doc| doc.key().clone())
                .collect();
            log::debug!(
                "query {} read {scanned} documents to return {}; building index",
                query.canonical_id(),
                result.len()
            );
            self.index_manager.register(query.clone(), keys);
        }
        result
    }
}

/// Filters, orders and limits the candidate set. `limit-to-last` queries run
/// as `limit-to-first` with reversed ordering and the result order is
/// flipped back, so the limit always evicts from the correct end.
fn finish(
    query: &Query,
    candidates: BTreeMap<DocumentKey, MutableDocument>,
) -> Vec<MutableDocument> {
    let exec = query.as_limit_to_first_for_server();
    let mut docs: Vec<MutableDocument> = candidates
        .into_values()
        .filter(|doc| query.matches(doc))
        .collect();
    docs.sort_by(|a, b| exec.comparator(a, b));
    if let Some(limit) = exec.limit() {
        docs.truncate(limit as usize);
    }
    if query.has_limit_to_last() {
        docs.reverse();
    }
    docs
}
