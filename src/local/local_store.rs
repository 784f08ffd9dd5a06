use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;

use crate::credentials::User;
use crate::error::{invalid_argument, SyncError, SyncResult};
use crate::local::local_documents::{
    get_document, get_overlaid_document, recalculate_overlays,
};
use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_cache::DocumentOverlayCache;
use crate::local::persistence::LocalPersistence;
use crate::local::query_engine::{QueryEngine, QueryEngineConfig};
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::{TargetCache, TargetState};
use crate::model::{
    calculate_overlay_mutation, DocumentKey, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, Timestamp,
};
use crate::query::Query;
use crate::remote::remote_event::RemoteEvent;

/// Outcome of enqueueing one local write.
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changed_docs: BTreeMap<DocumentKey, MutableDocument>,
}

/// Result of a local query execution.
pub struct QueryExecutionResult {
    pub documents: Vec<MutableDocument>,
    pub remote_keys: BTreeSet<DocumentKey>,
    pub current: bool,
}

struct LocalStoreState {
    user: User,
    queues: BTreeMap<User, MutationQueue>,
    overlays: DocumentOverlayCache,
    remote_documents: RemoteDocumentCache,
    targets: TargetCache,
    query_engine: QueryEngine,
}

impl LocalStoreState {
    fn queue(&mut self) -> &mut MutationQueue {
        self.queues.entry(self.user.clone()).or_default()
    }

    fn queue_ref(&self) -> Option<&MutationQueue> {
        self.queues.get(&self.user)
    }
}

/// Owns the mutation queue, overlay cache, remote document cache and target
/// cache, and answers "what does this document or query look like right
/// now". All durable operations flow through this store's lock, which gives
/// the persistence hooks their single-writer guarantee.
pub struct LocalStore {
    state: Mutex<LocalStoreState>,
    persistence: Arc<dyn LocalPersistence>,
    persistence_healthy: AtomicBool,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn LocalPersistence>, user: User) -> Self {
        Self::with_config(persistence, user, QueryEngineConfig::default())
    }

    pub fn with_config(
        persistence: Arc<dyn LocalPersistence>,
        user: User,
        config: QueryEngineConfig,
    ) -> Self {
        let loaded = persistence.load(&user).unwrap_or_else(|err| {
            log::warn!("failed to restore durable state: {err}");
            Default::default()
        });

        let mut queues = BTreeMap::new();
        queues.insert(user.clone(), MutationQueue::restore(loaded.batches));

        Self {
            state: Mutex::new(LocalStoreState {
                user,
                queues,
                overlays: DocumentOverlayCache::restore(loaded.overlays),
                remote_documents: RemoteDocumentCache::restore(loaded.documents),
                targets: TargetCache::restore(loaded.targets),
                query_engine: QueryEngine::new(config),
            }),
            persistence,
            persistence_healthy: AtomicBool::new(true),
        }
    }

    /// Runs a persistence hook, retrying contention once; a second failure
    /// degrades the store to memory-only operation with a one-time warning.
    fn persist(&self, op: impl Fn(&dyn LocalPersistence) -> SyncResult<()>) {
        if !self.persistence_healthy.load(Ordering::SeqCst) {
            return;
        }
        match op(self.persistence.as_ref()) {
            Ok(()) => {}
            Err(err) if err.is_retryable_storage_error() => {
                if let Err(err) = op(self.persistence.as_ref()) {
                    self.mark_persistence_failed(&err);
                }
            }
            Err(err) => self.mark_persistence_failed(&err),
        }
    }

    fn mark_persistence_failed(&self, err: &SyncError) {
        if self.persistence_healthy.swap(false, Ordering::SeqCst) {
            log::warn!(
                "durable storage is unavailable; continuing in memory-only mode: {err}"
            );
        }
    }

    pub async fn current_user(&self) -> User {
        self.state.lock().await.user.clone()
    }

    /// Switches the active user: the new user's queue becomes live and every
    /// overlay is rebuilt from it. Returns the local view of all documents
    /// whose overlays changed on either side of the switch.
    pub async fn handle_user_change(
        &self,
        user: User,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;
        if state.user == user {
            return Ok(BTreeMap::new());
        }

        let mut affected: BTreeSet<DocumentKey> = state.overlays.keys().cloned().collect();

        if !state.queues.contains_key(&user) {
            let restored = match self.persistence.load(&user) {
                Ok(persisted) => MutationQueue::restore(persisted.batches),
                Err(err) => {
                    log::warn!("failed to restore mutation queue for new user: {err}");
                    MutationQueue::new()
                }
            };
            state.queues.insert(user.clone(), restored);
        }
        state.user = user;

        if let Some(queue) = state.queue_ref() {
            for batch in queue.batches() {
                affected.extend(batch.keys());
            }
        }

        let LocalStoreState {
            queues,
            overlays,
            remote_documents,
            user: current_user,
            ..
        } = &mut *state;
        let queue = queues.entry(current_user.clone()).or_default();
        let docs = recalculate_overlays(remote_documents, queue, overlays, &affected);

        for key in &affected {
            let user = state.user.clone();
            match state.overlays.overlay_for(key).cloned() {
                Some(overlay) => {
                    self.persist(|p| p.save_overlay(&user, &overlay));
                }
                None => self.persist(|p| p.remove_overlay(&user, key)),
            }
        }
        Ok(docs)
    }

    /// Durably enqueues a batch and raises its overlay, returning the new
    /// local view of every affected document.
    pub async fn apply_local_write(
        &self,
        mutations: Vec<Mutation>,
    ) -> SyncResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(invalid_argument(
                "mutation batches must contain at least one mutation",
            ));
        }

        let mut state = self.state.lock().await;
        let local_write_time = Timestamp::now();
        let user = state.user.clone();

        let batch = state
            .queue()
            .add_batch(local_write_time, mutations)
            .clone();
        self.persist(|p| p.save_mutation_batch(&user, &batch));

        let mut changed_docs = BTreeMap::new();
        let mut new_overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
        for key in batch.keys() {
            let overlaid =
                get_overlaid_document(&state.remote_documents, &state.overlays, &key);
            let mut doc = overlaid.doc;
            let mask = batch.apply_to_local_view(&mut doc, overlaid.mutated_fields);
            if let Some(overlay) = calculate_overlay_mutation(&doc, mask.as_ref()) {
                new_overlays.insert(key.clone(), overlay);
            }
            changed_docs.insert(key, doc);
        }

        state.overlays.save_overlays(batch.batch_id, new_overlays);
        for key in batch.keys() {
            if let Some(overlay) = state.overlays.overlay_for(&key).cloned() {
                self.persist(|p| p.save_overlay(&user, &overlay));
            }
        }

        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changed_docs,
        })
    }

    /// Applies one coherent remote event: target bookkeeping first, then the
    /// version-gated document merges, then overlays are raised back on top
    /// of the changed documents.
    pub async fn apply_remote_event(
        &self,
        event: &RemoteEvent,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;

        for target_id in &event.target_resets {
            state.targets.reset(*target_id);
            let snapshot = state.targets.get(*target_id).cloned();
            if let Some(snapshot) = snapshot {
                self.persist(|p| p.save_target_state(&snapshot));
            }
        }

        for (target_id, change) in &event.target_changes {
            let target = state.targets.get_or_insert(*target_id);
            if let Some(token) = &change.resume_token {
                if !token.is_empty() {
                    target.resume_token = token.clone();
                }
            }
            if let Some(version) = event.snapshot_version {
                if version > target.snapshot_version {
                    target.snapshot_version = version;
                }
            }
            if change.current {
                target.current = true;
            }
            for key in &change.removed_documents {
                target.remote_keys.remove(key);
            }
            for key in change
                .added_documents
                .iter()
                .chain(change.modified_documents.iter())
            {
                target.remote_keys.insert(key.clone());
            }
            let snapshot = target.clone();
            self.persist(|p| p.save_target_state(&snapshot));
        }

        let read_time = event.snapshot_version.unwrap_or_else(Timestamp::now);
        let mut changed_keys = BTreeSet::new();
        for (key, doc) in &event.document_updates {
            let existing = state.remote_documents.get(key);
            let accept = !existing.is_valid_document()
                || doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
                || (doc.is_no_document() && doc.version().is_zero());
            if !accept {
                log::debug!(
                    "ignoring stale watch update for {} at {:?}",
                    key.path(),
                    doc.version()
                );
                continue;
            }
            state.remote_documents.add(doc.clone(), read_time);
            let persisted = state.remote_documents.get(key);
            self.persist(|p| p.save_remote_document(&persisted));
            changed_keys.insert(key.clone());
        }

        if let Some(version) = event.snapshot_version {
            state.targets.set_last_remote_snapshot_version(version);
        }

        let changed_docs: Vec<MutableDocument> = changed_keys
            .iter()
            .map(|key| state.remote_documents.get(key))
            .collect();
        state
            .query_engine
            .index_manager_mut()
            .update_entries(changed_docs.iter());

        Ok(changed_keys
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    get_document(&state.remote_documents, &state.overlays, key),
                )
            })
            .collect())
    }

    /// Applies the server's authoritative outcome of an acknowledged batch,
    /// then removes the batch and re-derives overlays for its keys.
    pub async fn acknowledge_batch(
        &self,
        result: &MutationBatchResult,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;
        let user = state.user.clone();
        let batch = state.queue().remove_batch(result.batch_id())?;
        self.persist(|p| p.remove_mutation_batch(&user, batch.batch_id));

        for key in batch.keys() {
            let mut doc = state.remote_documents.get(&key);
            let before_version = doc.version();
            batch.apply_to_remote_document(&mut doc, &result.mutation_results);
            if doc.version() > before_version || !state.remote_documents.contains(&key) {
                // The acknowledged state is server-confirmed; reads must no
                // longer report pending writes for it.
                if doc.is_found_document() || doc.is_no_document() {
                    doc.set_synced();
                }
                state.remote_documents.add(doc, result.commit_version);
                let persisted = state.remote_documents.get(&key);
                self.persist(|p| p.save_remote_document(&persisted));
            }
        }

        self.remove_batch_overlays(&mut state, &batch)
    }

    /// Drops a rejected batch without touching the remote document cache;
    /// the local view reverts to the last server-confirmed state because the
    /// overlay disappears with the batch.
    pub async fn reject_batch(
        &self,
        batch_id: i32,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.state.lock().await;
        let user = state.user.clone();
        let batch = state.queue().remove_batch(batch_id)?;
        self.persist(|p| p.remove_mutation_batch(&user, batch.batch_id));
        self.remove_batch_overlays(&mut state, &batch)
    }

    fn remove_batch_overlays(
        &self,
        state: &mut LocalStoreState,
        batch: &MutationBatch,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        let user = state.user.clone();
        state.overlays.remove_overlays_for_batch(batch.batch_id);

        let keys = batch.keys();
        let LocalStoreState {
            queues,
            overlays,
            remote_documents,
            user: current_user,
            ..
        } = &mut *state;
        let queue = queues.entry(current_user.clone()).or_default();
        recalculate_overlays(remote_documents, queue, overlays, &keys);

        for key in &keys {
            match state.overlays.overlay_for(key).cloned() {
                Some(overlay) => self.persist(|p| p.save_overlay(&user, &overlay)),
                None => self.persist(|p| p.remove_overlay(&user, key)),
            }
        }

        Ok(keys
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    get_document(&state.remote_documents, &state.overlays, key),
                )
            })
            .collect())
    }

    /// Executes a query against the materialized local document set.
    pub async fn execute_query(
        &self,
        query: &Query,
        target_id: Option<i32>,
    ) -> SyncResult<QueryExecutionResult> {
        let mut state = self.state.lock().await;
        let target_state = target_id.and_then(|id| state.targets.get(id)).cloned();
        let LocalStoreState {
            overlays,
            remote_documents,
            query_engine,
            ..
        } = &mut *state;
        let documents =
            query_engine.execute(remote_documents, overlays, query, target_state.as_ref());
        Ok(QueryExecutionResult {
            documents,
            remote_keys: target_state
                .as_ref()
                .map(|t| t.remote_keys.clone())
                .unwrap_or_default(),
            current: target_state.map(|t| t.current).unwrap_or(false),
        })
    }

    pub async fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let state = self.state.lock().await;
        get_document(&state.remote_documents, &state.overlays, key)
    }

    pub async fn target_state(&self, target_id: i32) -> Option<TargetState> {
        self.state.lock().await.targets.get(target_id).cloned()
    }

    pub async fn register_target(&self, target_id: i32) {
        let mut state = self.state.lock().await;
        state.targets.get_or_insert(target_id);
    }

    pub async fn release_target(&self, target_id: i32) {
        let mut state = self.state.lock().await;
        state.targets.remove(target_id);
        self.persist(|p| p.remove_target_state(target_id));
    }

    /// Records the snapshot version at which a target's view last had no
    /// limbo documents, enabling incremental query execution.
    pub async fn set_limbo_free_version(&self, target_id: i32, version: Timestamp) {
        let mut state = self.state.lock().await;
        let target = state.targets.get_or_insert(target_id);
        if version > target.last_limbo_free_snapshot_version {
            target.last_limbo_free_snapshot_version = version;
            let snapshot = target.clone();
            self.persist(|p| p.save_target_state(&snapshot));
        }
    }

    pub async fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.state
            .lock()
            .await
            .targets
            .get(target_id)
            .map(|t| t.remote_keys.clone())
            .unwrap_or_default()
    }

    pub async fn last_remote_snapshot_version(&self) -> Timestamp {
        self.state
            .lock()
            .await
            .targets
            .last_remote_snapshot_version()
    }

    /// The next batch the write pipeline should send, in id order.
    pub async fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> Option<MutationBatch> {
        let mut state = self.state.lock().await;
        state.queue().next_batch_after(after_batch_id).cloned()
    }

    pub async fn has_pending_batches(&self) -> bool {
        let mut state = self.state.lock().await;
        !state.queue().is_empty()
    }

    /// Evicts server-confirmed documents no longer referenced by any
    /// target, overlay, or in-flight limbo resolution. Returns how many
    /// documents were dropped.
    pub async fn collect_garbage(&self, limbo_keys: &BTreeSet<DocumentKey>) -> usize {
        let mut state = self.state.lock().await;
        let removable: Vec<DocumentKey> = state
            .remote_documents
            .keys()
            .filter(|key| {
                !state.targets.is_key_tracked(key)
                    && state.overlays.overlay_for(key).is_none()
                    && !limbo_keys.contains(*key)
            })
            .cloned()
            .collect();
        for key in &removable {
            state.remote_documents.remove(key);
            self.persist(|p| p.remove_remote_document(key));
        }
        if !removable.is_empty() {
            log::debug!("garbage collected {} orphaned documents", removable.len());
        }
        removable.len()
    }
}
