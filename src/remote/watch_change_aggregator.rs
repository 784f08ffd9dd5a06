use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{internal_error, SyncResult};
use crate::model::{DocumentKey, MutableDocument, Timestamp};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::serializer::WireSerializer;
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};

/// Lets the aggregator see which documents each target was already known to
/// contain, so incremental add/remove signals reconcile against real state.
pub trait TargetMetadataProvider: Send + Sync {
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey>;
}

impl TargetMetadataProvider for () {
    fn get_remote_keys(&self, _target_id: i32) -> BTreeSet<DocumentKey> {
        BTreeSet::new()
    }
}

/// Accumulates raw per-document watch signals keyed by target until a
/// `current` marker (or reset) arrives, then emits one coherent
/// [`RemoteEvent`] via [`WatchChangeAggregator::drain`].
pub struct WatchChangeAggregator<P = ()>
where
    P: TargetMetadataProvider,
{
    metadata: Arc<P>,
    serializer: WireSerializer,
    target_states: HashMap<i32, TargetState>,
    target_documents: HashMap<i32, BTreeSet<DocumentKey>>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_target_resets: BTreeSet<i32>,
    snapshot_version: Option<Timestamp>,
}

impl<P> WatchChangeAggregator<P>
where
    P: TargetMetadataProvider + 'static,
{
    pub fn new(metadata: Arc<P>, serializer: WireSerializer) -> Self {
        Self {
            metadata,
            serializer,
            target_states: HashMap::new(),
            target_documents: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_target_resets: BTreeSet::new(),
            snapshot_version: None,
        }
    }

    pub fn handle_watch_change(&mut self, change: WatchChange) -> SyncResult<()> {
        match change {
            WatchChange::TargetChange(target_change) => self.handle_target_change(target_change),
            WatchChange::DocumentChange(doc_change) => {
                self.handle_document_change(doc_change);
                Ok(())
            }
            WatchChange::DocumentDelete(delete) => {
                self.handle_document_delete(delete);
                Ok(())
            }
            WatchChange::DocumentRemove(remove) => {
                self.handle_document_remove(remove);
                Ok(())
            }
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(filter),
        }
    }

    fn handle_target_change(&mut self, change: WatchTargetChange) -> SyncResult<()> {
        if let Some(error) = change.cause.as_ref() {
            return Err(internal_error(format!(
                "watch target error ({}): {error}",
                error.code_str()
            )));
        }

        let affected: Vec<i32> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in affected {
            self.ensure_target(target_id);
            let state = self
                .target_states
                .get_mut(&target_id)
                .expect("target state just ensured");

            match change.state {
                TargetChangeState::NoChange => {
                    state.update_resume_token(change.resume_token.clone());
                }
                TargetChangeState::Add => {
                    state.update_resume_token(change.resume_token.clone());
                }
                TargetChangeState::Remove => {
                    self.target_states.remove(&target_id);
                    self.target_documents.remove(&target_id);
                }
                TargetChangeState::Current => {
                    state.current = true;
                    state.update_resume_token(change.resume_token.clone());
                    state.dirty = true;
                }
                TargetChangeState::Reset => {
                    state.reset();
                    state.update_resume_token(change.resume_token.clone());
                    self.pending_target_resets.insert(target_id);
                }
            }
        }
        Ok(())
    }

    fn handle_document_change(&mut self, change: DocumentChange) {
        let key = change.document.key().clone();
        for target_id in &change.updated_target_ids {
            self.track_document(*target_id, &key, true);
        }
        for target_id in &change.removed_target_ids {
            self.track_document(*target_id, &key, false);
        }
        self.pending_document_updates.insert(key, change.document);
    }

    fn handle_document_delete(&mut self, delete: DocumentDelete) {
        for target_id in &delete.removed_target_ids {
            self.track_document(*target_id, &delete.key, false);
        }
        let version = delete.read_time.unwrap_or(Timestamp::ZERO);
        self.pending_document_updates.insert(
            delete.key.clone(),
            MutableDocument::new_no_document(delete.key, version),
        );
    }

    fn handle_document_remove(&mut self, remove: DocumentRemove) {
        // The document stopped matching the target but still exists; no
        // document update is synthesized.
        for target_id in &remove.removed_target_ids {
            self.track_document(*target_id, &remove.key, false);
        }
    }

    /// Reconciles a server-reported matching-document count with the local
    /// accounting. A bloom filter, when present, lets the client drop
    /// missed deletes individually; a full target reset is the fallback.
    fn handle_existence_filter(&mut self, filter: ExistenceFilterChange) -> SyncResult<()> {
        let target_id = filter.target_id;
        self.ensure_target(target_id);
        let local_count = self
            .target_documents
            .get(&target_id)
            .map(BTreeSet::len)
            .unwrap_or(0);

        if filter.count as usize == local_count {
            return Ok(());
        }

        if let Some(spec) = &filter.unchanged_names {
            if let Ok(bloom) = BloomFilter::new(spec.bitmap.clone(), spec.padding, spec.hash_count)
            {
                let removed = self.remove_keys_missing_from_filter(target_id, &bloom);
                log::debug!(
                    "existence filter purged {removed} documents from target {target_id} via bloom check"
                );
                let local_count = self
                    .target_documents
                    .get(&target_id)
                    .map(BTreeSet::len)
                    .unwrap_or(0);
                if filter.count as usize == local_count {
                    return Ok(());
                }
            }
        }

        log::debug!(
            "existence filter mismatch on target {target_id} (server {}, local {local_count}); scheduling reset",
            filter.count
        );
        if let Some(state) = self.target_states.get_mut(&target_id) {
            state.reset();
        }
        self.target_documents.remove(&target_id);
        self.pending_target_resets.insert(target_id);
        Ok(())
    }

    fn remove_keys_missing_from_filter(&mut self, target_id: i32, bloom: &BloomFilter) -> usize {
        let Some(docs) = self.target_documents.get(&target_id) else {
            return 0;
        };
        let missing: Vec<DocumentKey> = docs
            .iter()
            .filter(|key| !bloom.might_contain(&self.serializer.document_name(key)))
            .cloned()
            .collect();

        for key in &missing {
            self.track_document(target_id, key, false);
            // Synthesized delete: version zero beats any cached state.
            self.pending_document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), Timestamp::ZERO),
            );
        }
        missing.len()
    }

    fn ensure_target(&mut self, target_id: i32) {
        self.target_states.entry(target_id).or_default();
        if !self.target_documents.contains_key(&target_id) {
            self.target_documents
                .insert(target_id, self.metadata.get_remote_keys(target_id));
        }
    }

    fn track_document(&mut self, target_id: i32, key: &DocumentKey, present: bool) {
        self.ensure_target(target_id);
        let docs = self
            .target_documents
            .get_mut(&target_id)
            .expect("target documents just ensured");
        let state = self
            .target_states
            .get_mut(&target_id)
            .expect("target state just ensured");

        if present {
            if docs.insert(key.clone()) {
                state.added.insert(key.clone());
            } else {
                state.modified.insert(key.clone());
            }
            state.dirty = true;
        } else if docs.remove(key) {
            state.added.remove(key);
            state.modified.remove(key);
            state.removed.insert(key.clone());
            state.dirty = true;
        }
    }

    pub fn set_snapshot_version(&mut self, version: Option<Timestamp>) {
        if version.is_some() {
            self.snapshot_version = version;
        }
    }

    /// Emits everything accumulated since the last drain as one event.
    pub fn drain(&mut self) -> RemoteEvent {
        let target_changes = self
            .target_states
            .iter_mut()
            .filter_map(|(target_id, state)| {
                state.take_changes().map(|change| (*target_id, change))
            })
            .collect();

        RemoteEvent {
            snapshot_version: self.snapshot_version.take(),
            target_changes,
            target_resets: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
struct TargetState {
    resume_token: Option<Vec<u8>>,
    current: bool,
    added: BTreeSet<DocumentKey>,
    modified: BTreeSet<DocumentKey>,
    removed: BTreeSet<DocumentKey>,
    dirty: bool,
}

impl TargetState {
    fn reset(&mut self) {
        self.added.clear();
        self.modified.clear();
        self.removed.clear();
        self.current = false;
        self.dirty = true;
    }

    fn update_resume_token(&mut self, token: Option<Vec<u8>>) {
        if token.as_ref().is_some_and(|t| !t.is_empty()) {
            self.resume_token = token;
            self.dirty = true;
        }
    }

    fn take_changes(&mut self) -> Option<TargetChange> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents: std::mem::take(&mut self.added),
            modified_documents: std::mem::take(&mut self.modified),
            removed_documents: std::mem::take(&mut self.removed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseId;
    use crate::remote::bloom_filter::build_bitmap;
    use crate::remote::watch_change::BloomFilterSpec;
    use crate::value::MapValue;

    struct FixedMetadata {
        keys: BTreeSet<DocumentKey>,
    }

    impl TargetMetadataProvider for FixedMetadata {
        fn get_remote_keys(&self, _target_id: i32) -> BTreeSet<DocumentKey> {
            self.keys.clone()
        }
    }

    fn serializer() -> WireSerializer {
        WireSerializer::new(DatabaseId::new("volt-app", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn found(path: &str) -> MutableDocument {
        MutableDocument::new_found(key(path), Timestamp::new(5, 0), MapValue::empty())
    }

    fn aggregator_with_keys(keys: &[&str]) -> WatchChangeAggregator<FixedMetadata> {
        let metadata = FixedMetadata {
            keys: keys.iter().map(|path| key(path)).collect(),
        };
        WatchChangeAggregator::new(Arc::new(metadata), serializer())
    }

    #[test]
    fn document_changes_accumulate_until_drain() {
        let mut aggregator = aggregator_with_keys(&[]);
        aggregator
            .handle_watch_change(WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                document: found("stations/a"),
            }))
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::TargetChange(WatchTargetChange {
                state: TargetChangeState::Current,
                target_ids: vec![2],
                resume_token: Some(vec![7]),
                read_time: Some(Timestamp::new(9, 0)),
                cause: None,
            }))
            .unwrap();
        aggregator.set_snapshot_version(Some(Timestamp::new(9, 0)));

        let event = aggregator.drain();
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.current);
        assert!(change.added_documents.contains(&key("stations/a")));
        assert_eq!(change.resume_token.as_deref(), Some(&[7][..]));
        assert!(event.document_updates.contains_key(&key("stations/a")));
        assert_eq!(event.snapshot_version, Some(Timestamp::new(9, 0)));

        // A second drain with no new changes is empty.
        assert!(aggregator.drain().is_empty());
    }

    #[test]
    fn matching_existence_filter_is_a_no_op() {
        let mut aggregator = aggregator_with_keys(&["stations/a"]);
        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            }))
            .unwrap();
        assert!(aggregator.drain().target_resets.is_empty());
    }

    #[test]
    fn mismatched_existence_filter_resets_target() {
        // Locally tracking four documents while the server reports three.
        let mut aggregator =
            aggregator_with_keys(&["stations/a", "stations/b", "stations/c", "stations/d"]);
        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 3,
                unchanged_names: None,
            }))
            .unwrap();

        let event = aggregator.drain();
        assert!(event.target_resets.contains(&2));
    }

    #[test]
    fn bloom_filter_avoids_reset_by_synthesizing_deletes() {
        let serializer = serializer();
        let mut aggregator = aggregator_with_keys(&["stations/a", "stations/b"]);

        // The server kept only stations/a; the bloom filter proves
        // stations/b was deleted.
        let member = serializer.document_name(&key("stations/a"));
        let bitmap = build_bitmap(&[member.as_str()], 256, 7);
        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(BloomFilterSpec {
                    bitmap,
                    padding: 0,
                    hash_count: 7,
                }),
            }))
            .unwrap();

        let event = aggregator.drain();
        assert!(event.target_resets.is_empty());
        let synthesized = event.document_updates.get(&key("stations/b")).unwrap();
        assert!(synthesized.is_no_document());
        assert!(synthesized.version().is_zero());
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.removed_documents.contains(&key("stations/b")));
    }

    #[test]
    fn target_error_is_fatal_for_the_aggregator() {
        let mut aggregator = aggregator_with_keys(&[]);
        let err = aggregator
            .handle_watch_change(WatchChange::TargetChange(WatchTargetChange {
                state: TargetChangeState::NoChange,
                target_ids: vec![2],
                resume_token: None,
                read_time: None,
                cause: Some(crate::error::permission_denied("denied")),
            }))
            .unwrap_err();
        assert_eq!(err.code_str(), "gridbase/internal");
    }
}
