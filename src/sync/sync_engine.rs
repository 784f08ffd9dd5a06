use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::oneshot;
use once_cell::sync::OnceCell;

use crate::credentials::{CredentialsProvider, User};
use crate::error::{cancelled, SyncError, SyncResult};
use crate::local::{LocalStore, TargetIdGenerator};
use crate::model::{
    DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult, Timestamp,
};
use crate::query::Query;
use crate::remote::{
    Connection, RemoteEvent, RemoteStore, RemoteStoreConfig, RemoteSyncer, WatchTarget,
    WireSerializer,
};
use crate::sync::event_manager::{EventManager, ListenOptions, SnapshotListener};
use crate::sync::view::{LimboDocumentChange, View};
use crate::util::runtime;

#[derive(Clone, Copy, Debug)]
pub struct SyncEngineConfig {
    /// Admission bound on concurrently active limbo resolutions; excess
    /// limbo keys queue until a slot frees.
    pub max_concurrent_limbo_resolutions: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: 100,
        }
    }
}

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

struct SyncEngineState {
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, String>,
    query_id_generator: TargetIdGenerator,
    limbo_id_generator: TargetIdGenerator,
    limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    limbo_keys_by_target: BTreeMap<i32, DocumentKey>,
    enqueued_limbo: VecDeque<DocumentKey>,
    write_callbacks: BTreeMap<i32, oneshot::Sender<SyncResult<()>>>,
    event_manager: EventManager,
}

/// The top-level coordinator: maps application listens onto targets
/// (reference-counted across identical queries), routes local writes into
/// the local store and write pipeline, applies remote events, resolves
/// limbo documents, and raises deduplicated snapshots to listeners.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

pub struct SyncEngineInner {
    local_store: Arc<LocalStore>,
    remote_store: OnceCell<RemoteStore>,
    config: SyncEngineConfig,
    online: AtomicBool,
    state: Mutex<SyncEngineState>,
    /// Mirror of each target's server-confirmed keys, readable without the
    /// engine lock; the watch-change aggregator consults it from inside the
    /// remote store.
    remote_keys: StdMutex<BTreeMap<i32, BTreeSet<DocumentKey>>>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: WireSerializer,
        remote_config: RemoteStoreConfig,
        config: SyncEngineConfig,
    ) -> Self {
        let inner = Arc::new(SyncEngineInner {
            local_store,
            remote_store: OnceCell::new(),
            config,
            online: AtomicBool::new(true),
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                query_id_generator: TargetIdGenerator::for_queries(),
                limbo_id_generator: TargetIdGenerator::for_limbo_resolutions(),
                limbo_targets_by_key: BTreeMap::new(),
                limbo_keys_by_target: BTreeMap::new(),
                enqueued_limbo: VecDeque::new(),
                write_callbacks: BTreeMap::new(),
                event_manager: EventManager::default(),
            }),
            remote_keys: StdMutex::new(BTreeMap::new()),
        });

        let remote = RemoteStore::new(
            connection,
            credentials,
            serializer,
            Arc::clone(&inner) as Arc<dyn RemoteSyncer>,
            remote_config,
        );
        let _ = inner.remote_store.set(remote);
        Self { inner }
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    /// Subscribes to a query. Identical queries share one target; each call
    /// gets an independent registration whose drop detaches only that
    /// listener.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        listener: SnapshotListener,
    ) -> SyncResult<ListenerRegistration> {
        let inner = &self.inner;
        let query_id = query.canonical_id();
        let mut state = inner.state.lock().await;
        let (listener_id, first) = state.event_manager.add_listener(&query, options, listener);

        if first {
            let target_id = state.query_id_generator.next();
            inner.local_store.register_target(target_id).await;
            let execution = inner.local_store.execute_query(&query, Some(target_id)).await?;
            inner.set_remote_keys_mirror(target_id, execution.remote_keys.clone());

            let mut view = View::new(query.clone());
            let current = execution.current.then_some(true);
            let view_change = view.apply(
                execution.documents,
                current,
                &execution.remote_keys,
                inner.is_online(),
            );

            state.queries_by_target.insert(target_id, query_id.clone());
            state.query_views.insert(
                query_id.clone(),
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            if let Some(snapshot) = view_change.snapshot {
                state.event_manager.dispatch_snapshot(&query_id, &snapshot);
            }

            let resume_token = inner
                .local_store
                .target_state(target_id)
                .await
                .map(|t| t.resume_token)
                .unwrap_or_default();
            let watch = WatchTarget::for_query(inner.remote().serializer(), target_id, &query)?
                .with_resume_token(resume_token);
            inner.remote().listen(watch).await?;
        } else if let Some(query_view) = state.query_views.get(&query_id) {
            let snapshot = query_view.view.initial_snapshot();
            state
                .event_manager
                .raise_initial(&query_id, listener_id, snapshot);
        }

        Ok(ListenerRegistration {
            inner: Arc::downgrade(inner),
            query_id,
            listener_id,
            detached: false,
        })
    }

    /// Durably enqueues a write batch and applies it to local views. The
    /// returned ack resolves once the server accepts or permanently rejects
    /// the batch.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<WriteAck> {
        let result = self.inner.local_store.apply_local_write(mutations).await?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            state.write_callbacks.insert(result.batch_id, tx);
            self.inner
                .recompute_views(&mut state, &BTreeMap::new(), None)
                .await?;
        }
        self.inner.remote().pump_writes().await?;
        Ok(WriteAck {
            batch_id: result.batch_id,
            rx,
        })
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner.online.store(true, Ordering::SeqCst);
        self.inner.remote().enable_network().await?;
        let mut state = self.inner.state.lock().await;
        self.inner
            .recompute_views(&mut state, &BTreeMap::new(), None)
            .await
    }

    /// Takes the client offline: streams stop, queued work is retained, and
    /// every view re-emits with `from_cache`.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner.online.store(false, Ordering::SeqCst);
        self.inner.remote().disable_network().await?;
        let mut state = self.inner.state.lock().await;
        self.inner
            .recompute_views(&mut state, &BTreeMap::new(), None)
            .await
    }

    /// Switches the active user: local state flips to the new user's queue
    /// and the streams restart with fresh credentials.
    pub async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        self.inner.local_store.handle_user_change(user).await?;
        {
            let mut state = self.inner.state.lock().await;
            self.inner
                .recompute_views(&mut state, &BTreeMap::new(), None)
                .await?;
        }
        self.inner.remote().handle_credential_change().await
    }

    /// Keys currently held only for limbo resolution; the garbage collector
    /// must not evict them.
    pub async fn limbo_keys(&self) -> BTreeSet<DocumentKey> {
        let state = self.inner.state.lock().await;
        state
            .limbo_targets_by_key
            .keys()
            .cloned()
            .chain(state.enqueued_limbo.iter().cloned())
            .collect()
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.remote().shutdown().await
    }

    #[cfg(test)]
    pub(crate) async fn active_query_count(&self) -> usize {
        self.inner.state.lock().await.query_views.len()
    }

    #[cfg(test)]
    pub(crate) async fn limbo_state(&self) -> (BTreeSet<DocumentKey>, Vec<DocumentKey>) {
        let state = self.inner.state.lock().await;
        (
            state.limbo_targets_by_key.keys().cloned().collect(),
            state.enqueued_limbo.iter().cloned().collect(),
        )
    }
}

impl SyncEngineInner {
    fn remote(&self) -> &RemoteStore {
        self.remote_store
            .get()
            .expect("remote store is wired during construction")
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_remote_keys_mirror(&self, target_id: i32, keys: BTreeSet<DocumentKey>) {
        self.remote_keys.lock().unwrap().insert(target_id, keys);
    }

    fn clear_remote_keys_mirror(&self, target_id: i32) {
        self.remote_keys.lock().unwrap().remove(&target_id);
    }

    async fn refresh_remote_keys_mirror(&self, target_id: i32) {
        let keys = self.local_store.remote_keys_for_target(target_id).await;
        self.set_remote_keys_mirror(target_id, keys);
    }

    /// Re-runs every active query against the local store and pushes the
    /// resulting diffs through views, listeners, and limbo tracking.
    /// `current_overrides` carries per-target caught-up transitions from a
    /// remote event.
    async fn recompute_views(
        &self,
        state: &mut SyncEngineState,
        current_overrides: &BTreeMap<i32, bool>,
        snapshot_version: Option<Timestamp>,
    ) -> SyncResult<()> {
        let query_ids: Vec<String> = state.query_views.keys().cloned().collect();
        let online = self.is_online();

        for query_id in query_ids {
            let (query, target_id) = {
                let query_view = state
                    .query_views
                    .get(&query_id)
                    .expect("query view exists for collected id");
                (query_view.query.clone(), query_view.target_id)
            };
            let execution = self.local_store.execute_query(&query, Some(target_id)).await?;
            let current = current_overrides.get(&target_id).copied();

            let view_change = {
                let query_view = state
                    .query_views
                    .get_mut(&query_id)
                    .expect("query view exists for collected id");
                query_view
                    .view
                    .apply(execution.documents, current, &execution.remote_keys, online)
            };

            if let Some(snapshot) = view_change.snapshot {
                state.event_manager.dispatch_snapshot(&query_id, &snapshot);
            }
            for limbo_change in view_change.limbo_changes {
                match limbo_change {
                    LimboDocumentChange::Added(key) => {
                        if !state.limbo_targets_by_key.contains_key(&key)
                            && !state.enqueued_limbo.contains(&key)
                        {
                            state.enqueued_limbo.push_back(key);
                        }
                    }
                    LimboDocumentChange::Removed(key) => {
                        self.maybe_drop_limbo_resolution(state, &key).await;
                    }
                }
            }
        }

        self.pump_limbo_queue(state).await?;

        if let Some(version) = snapshot_version {
            for query_view in state.query_views.values() {
                if query_view.view.is_current() && query_view.view.limbo_documents().is_empty() {
                    self.local_store
                        .set_limbo_free_version(query_view.target_id, version)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Tears a limbo resolution down once no view references the key.
    async fn maybe_drop_limbo_resolution(&self, state: &mut SyncEngineState, key: &DocumentKey) {
        let still_referenced = state
            .query_views
            .values()
            .any(|query_view| query_view.view.limbo_documents().contains(key));
        if still_referenced {
            return;
        }

        state.enqueued_limbo.retain(|queued| queued != key);
        if let Some(target_id) = state.limbo_targets_by_key.remove(key) {
            state.limbo_keys_by_target.remove(&target_id);
            self.local_store.release_target(target_id).await;
            self.clear_remote_keys_mirror(target_id);
            if let Err(err) = self.remote().unlisten(target_id).await {
                log::warn!("failed to stop limbo resolution for {}: {err}", key.path());
            }
        }
    }

    /// Starts queued limbo resolutions while the admission bound allows.
    async fn pump_limbo_queue(&self, state: &mut SyncEngineState) -> SyncResult<()> {
        while state.limbo_keys_by_target.len() < self.config.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo.pop_front() else {
                break;
            };
            if state.limbo_targets_by_key.contains_key(&key) {
                continue;
            }
            let target_id = state.limbo_id_generator.next();
            state.limbo_targets_by_key.insert(key.clone(), target_id);
            state.limbo_keys_by_target.insert(target_id, key.clone());
            self.local_store.register_target(target_id).await;
            log::debug!("resolving limbo document {} via target {target_id}", key.path());
            let watch =
                WatchTarget::for_document(self.remote().serializer(), target_id, &key);
            self.remote().listen(watch).await?;
        }
        Ok(())
    }

    async fn finish_limbo_resolution(
        &self,
        state: &mut SyncEngineState,
        target_id: i32,
    ) -> SyncResult<()> {
        if let Some(key) = state.limbo_keys_by_target.remove(&target_id) {
            state.limbo_targets_by_key.remove(&key);
            self.local_store.release_target(target_id).await;
            self.clear_remote_keys_mirror(target_id);
            if let Err(err) = self.remote().unlisten(target_id).await {
                log::warn!("failed to unlisten resolved limbo target {target_id}: {err}");
            }
        }
        self.pump_limbo_queue(state).await
    }

    fn resolve_write_callback(
        state: &mut SyncEngineState,
        batch_id: i32,
        result: SyncResult<()>,
    ) {
        if let Some(tx) = state.write_callbacks.remove(&batch_id) {
            let _ = tx.send(result);
        }
    }
}

async fn remove_listener(inner: Arc<SyncEngineInner>, query_id: String, listener_id: u64) {
    let mut state = inner.state.lock().await;
    if !state.event_manager.remove_listener(&query_id, listener_id) {
        return;
    }

    // Last listener gone: tear the target down.
    let Some(query_view) = state.query_views.remove(&query_id) else {
        return;
    };
    state.queries_by_target.remove(&query_view.target_id);
    inner.local_store.release_target(query_view.target_id).await;
    inner.clear_remote_keys_mirror(query_view.target_id);

    let limbo_keys: Vec<DocumentKey> =
        query_view.view.limbo_documents().iter().cloned().collect();
    for key in limbo_keys {
        inner.maybe_drop_limbo_resolution(&mut state, &key).await;
    }
    drop(state);

    if let Err(err) = inner.remote().unlisten(query_view.target_id).await {
        log::warn!("failed to unlisten target {}: {err}", query_view.target_id);
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngineInner {
    async fn apply_remote_event(&self, mut event: RemoteEvent) -> SyncResult<()> {
        // A limbo target that reports `current` without carrying its
        // document is an authoritative miss: synthesize a deletion.
        let resolved_limbo_targets: Vec<i32> = {
            let state = self.state.lock().await;
            let mut resolved = Vec::new();
            for (target_id, change) in &event.target_changes {
                let Some(key) = state.limbo_keys_by_target.get(target_id) else {
                    continue;
                };
                if change.current {
                    if !event.document_updates.contains_key(key) {
                        event.document_updates.insert(
                            key.clone(),
                            MutableDocument::new_no_document(key.clone(), Timestamp::ZERO),
                        );
                    }
                    event.resolved_limbo_documents.insert(key.clone());
                    resolved.push(*target_id);
                }
            }
            resolved
        };

        self.local_store.apply_remote_event(&event).await?;

        for target_id in event.target_changes.keys().chain(event.target_resets.iter()) {
            self.refresh_remote_keys_mirror(*target_id).await;
        }

        let mut overrides: BTreeMap<i32, bool> = event
            .target_changes
            .iter()
            .filter(|(_, change)| change.current)
            .map(|(target_id, _)| (*target_id, true))
            .collect();
        for target_id in &event.target_resets {
            overrides.insert(*target_id, false);
        }

        let mut state = self.state.lock().await;
        for target_id in resolved_limbo_targets {
            self.finish_limbo_resolution(&mut state, target_id).await?;
        }
        self.recompute_views(&mut state, &overrides, event.snapshot_version)
            .await
    }

    async fn reject_listen(&self, target_id: i32, error: SyncError) -> SyncResult<()> {
        let limbo_key = {
            let state = self.state.lock().await;
            state.limbo_keys_by_target.get(&target_id).cloned()
        };

        if let Some(key) = limbo_key {
            // Treat a rejected limbo resolution as an authoritative miss so
            // the view stops referencing the document.
            let mut event = RemoteEvent::default();
            event
                .document_updates
                .insert(key.clone(), MutableDocument::new_no_document(key, Timestamp::ZERO));
            self.local_store.apply_remote_event(&event).await?;

            let mut state = self.state.lock().await;
            self.finish_limbo_resolution(&mut state, target_id).await?;
            return self.recompute_views(&mut state, &BTreeMap::new(), None).await;
        }

        let mut state = self.state.lock().await;
        if let Some(query_id) = state.queries_by_target.remove(&target_id) {
            state.query_views.remove(&query_id);
            state.event_manager.dispatch_error(&query_id, &error);
        }
        self.local_store.release_target(target_id).await;
        self.clear_remote_keys_mirror(target_id);
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch_id();
        self.local_store.acknowledge_batch(&result).await?;
        let mut state = self.state.lock().await;
        SyncEngineInner::resolve_write_callback(&mut state, batch_id, Ok(()));
        self.recompute_views(&mut state, &BTreeMap::new(), None).await
    }

    async fn reject_failed_write(&self, batch_id: i32, error: SyncError) -> SyncResult<()> {
        self.local_store.reject_batch(batch_id).await?;
        let mut state = self.state.lock().await;
        SyncEngineInner::resolve_write_callback(&mut state, batch_id, Err(error));
        self.recompute_views(&mut state, &BTreeMap::new(), None).await
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.remote_keys
            .lock()
            .unwrap()
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> SyncResult<Option<MutationBatch>> {
        Ok(self.local_store.next_mutation_batch(after_batch_id).await)
    }
}

/// Handle returned by `listen`; dropping (or detaching) it removes the
/// listener, and the underlying target once no listener remains.
pub struct ListenerRegistration {
    inner: Weak<SyncEngineInner>,
    query_id: String,
    listener_id: u64,
    detached: bool,
}

impl ListenerRegistration {
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(inner) = self.inner.upgrade() {
            let query_id = self.query_id.clone();
            let listener_id = self.listener_id;
            runtime::spawn_detached(async move {
                remove_listener(inner, query_id, listener_id).await;
            });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Resolves when the server acknowledges or permanently rejects the batch.
pub struct WriteAck {
    batch_id: i32,
    rx: oneshot::Receiver<SyncResult<()>>,
}

impl WriteAck {
    pub fn batch_id(&self) -> i32 {
        self.batch_id
    }

    pub async fn wait(self) -> SyncResult<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("the client shut down before the write settled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AnonymousCredentials;
    use crate::local::MemoryPersistence;
    use crate::model::{DatabaseId, ResourcePath};
    use crate::remote::remote_event::TargetChange;
    use crate::remote::transport::{InMemoryTransport, MultiplexedConnection};
    use crate::util::runtime;
    use crate::value::{FieldValue, MapValue};
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine_with_config(config: SyncEngineConfig) -> SyncEngine {
        let (client_transport, _server_transport) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client_transport));
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence),
            User::unauthenticated(),
        ));
        SyncEngine::new(
            local_store,
            connection,
            Arc::new(AnonymousCredentials),
            WireSerializer::new(DatabaseId::new("volt-app", "(default)")),
            RemoteStoreConfig::default(),
            config,
        )
    }

    fn engine() -> SyncEngine {
        engine_with_config(SyncEngineConfig::default())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn stations_query() -> Query {
        Query::collection(ResourcePath::from_string("stations").unwrap())
    }

    fn found(path: &str, kwh: i64, version: Timestamp) -> MutableDocument {
        let mut fields = Map::new();
        fields.insert("kwh".to_string(), FieldValue::from_integer(kwh));
        MutableDocument::new_found(key(path), version, MapValue::new(fields))
    }

    fn counting_listener() -> (SnapshotListener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (
            SnapshotListener::new(move |_snapshot| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[tokio::test]
    async fn identical_queries_share_one_target() {
        let engine = engine();
        let (listener_a, count_a) = counting_listener();
        let (listener_b, count_b) = counting_listener();

        let registration_a = engine
            .listen(stations_query(), ListenOptions::default(), listener_a)
            .await
            .unwrap();
        let registration_b = engine
            .listen(stations_query(), ListenOptions::default(), listener_b)
            .await
            .unwrap();

        assert_eq!(engine.active_query_count().await, 1);
        // Both listeners got an initial snapshot.
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);

        // Dropping one listener must not tear the shared target down.
        drop(registration_a);
        runtime::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.active_query_count().await, 1);

        drop(registration_b);
        runtime::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.active_query_count().await, 0);
    }

    #[tokio::test]
    async fn local_write_raises_optimistic_snapshot() {
        let engine = engine();
        let snapshots = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&snapshots);
        let listener = SnapshotListener::new(move |snapshot| {
            seen.lock().unwrap().push(snapshot);
        });
        let _registration = engine
            .listen(stations_query(), ListenOptions::default(), listener)
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("kwh".to_string(), FieldValue::from_integer(50));
        let _ack = engine
            .write(vec![Mutation::set(key("stations/new"), MapValue::new(fields))])
            .await
            .unwrap();

        let snapshots = snapshots.lock().unwrap();
        let last = snapshots.last().unwrap();
        assert_eq!(last.documents.len(), 1);
        assert!(last.has_pending_writes);
        assert!(last.from_cache);
    }

    #[tokio::test]
    async fn write_ack_resolves_after_server_acknowledgement() {
        let engine = engine();
        let ack = engine
            .write(vec![Mutation::set(key("stations/a"), MapValue::empty())])
            .await
            .unwrap();
        let batch_id = ack.batch_id();

        let batch = engine
            .local_store()
            .next_mutation_batch(None)
            .await
            .unwrap();
        let result = MutationBatchResult::new(
            batch,
            Timestamp::new(9, 0),
            vec![crate::model::MutationResult {
                version: Timestamp::new(9, 0),
                transform_results: Vec::new(),
            }],
        );
        engine.inner.apply_successful_write(result).await.unwrap();

        ack.wait().await.unwrap();
        let doc = engine.local_store().get_document(&key("stations/a")).await;
        assert!(!doc.has_pending_writes());
        assert_eq!(batch_id, 1);
    }

    #[tokio::test]
    async fn rejected_write_resolves_ack_with_server_reason() {
        let engine = engine();
        let ack = engine
            .write(vec![Mutation::set(key("stations/a"), MapValue::empty())])
            .await
            .unwrap();
        engine
            .inner
            .reject_failed_write(ack.batch_id(), crate::error::permission_denied("nope"))
            .await
            .unwrap();

        let err = ack.wait().await.unwrap_err();
        assert_eq!(err.code_str(), "gridbase/permission-denied");
        assert!(!engine
            .local_store()
            .get_document(&key("stations/a"))
            .await
            .is_valid_document());
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_admission_bound() {
        let engine = engine_with_config(SyncEngineConfig {
            max_concurrent_limbo_resolutions: 1,
        });
        let (listener, _count) = counting_listener();
        let _registration = engine
            .listen(stations_query(), ListenOptions::default(), listener)
            .await
            .unwrap();

        // Server syncs three documents and declares the target current.
        let mut change = TargetChange::default();
        change.current = true;
        for id in ["a", "b", "c"] {
            change.added_documents.insert(key(&format!("stations/{id}")));
        }
        let mut event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(5, 0)),
            target_changes: [(2, change)].into(),
            ..Default::default()
        };
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            event.document_updates.insert(
                key(&format!("stations/{id}")),
                found(&format!("stations/{id}"), i as i64, Timestamp::new(5, 0)),
            );
        }
        engine.inner.apply_remote_event(event).await.unwrap();

        // A reset wipes the target's accounting; on re-sync the server only
        // re-adds a. The full scan still returns the cached b and c, so once
        // the target is current again both are limbo.
        let event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(6, 0)),
            target_resets: [2].into(),
            ..Default::default()
        };
        engine.inner.apply_remote_event(event).await.unwrap();

        let mut change = TargetChange::default();
        change.current = true;
        change.added_documents.insert(key("stations/a"));
        let event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(7, 0)),
            target_changes: [(2, change)].into(),
            ..Default::default()
        };
        engine.inner.apply_remote_event(event).await.unwrap();

        let (active, queued) = engine.limbo_state().await;
        assert_eq!(active.len(), 1, "only one resolution may be in flight");
        assert_eq!(queued.len(), 1, "the second limbo key must queue");

        // Resolving the active one admits the queued one.
        let active_key = active.iter().next().unwrap().clone();
        let limbo_target = {
            let state = engine.inner.state.lock().await;
            *state.limbo_targets_by_key.get(&active_key).unwrap()
        };
        let mut change = TargetChange::default();
        change.current = true;
        let event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(8, 0)),
            target_changes: [(limbo_target, change)].into(),
            ..Default::default()
        };
        engine.inner.apply_remote_event(event).await.unwrap();

        let (active, queued) = engine.limbo_state().await;
        assert_eq!(active.len(), 1);
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn limbo_miss_synthesizes_deletion() {
        let engine = engine();
        let (listener, _count) = counting_listener();
        let _registration = engine
            .listen(stations_query(), ListenOptions::default(), listener)
            .await
            .unwrap();

        let mut change = TargetChange::default();
        change.current = true;
        change.added_documents.insert(key("stations/a"));
        change.added_documents.insert(key("stations/b"));
        let mut event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(5, 0)),
            target_changes: [(2, change)].into(),
            ..Default::default()
        };
        event
            .document_updates
            .insert(key("stations/a"), found("stations/a", 1, Timestamp::new(5, 0)));
        event
            .document_updates
            .insert(key("stations/b"), found("stations/b", 2, Timestamp::new(5, 0)));
        engine.inner.apply_remote_event(event).await.unwrap();

        // Reset the target; the re-sync only re-adds a, so the cached b
        // goes limbo once the target is current again.
        let event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(6, 0)),
            target_resets: [2].into(),
            ..Default::default()
        };
        engine.inner.apply_remote_event(event).await.unwrap();

        let mut change = TargetChange::default();
        change.current = true;
        change.added_documents.insert(key("stations/a"));
        let event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(7, 0)),
            target_changes: [(2, change)].into(),
            ..Default::default()
        };
        engine.inner.apply_remote_event(event).await.unwrap();

        let (active, _) = engine.limbo_state().await;
        let limbo_target = {
            let state = engine.inner.state.lock().await;
            *state.limbo_targets_by_key.get(active.iter().next().unwrap()).unwrap()
        };

        // The limbo target reports current without the document: the local
        // cache must now hold a tombstone.
        let mut change = TargetChange::default();
        change.current = true;
        let event = RemoteEvent {
            snapshot_version: Some(Timestamp::new(8, 0)),
            target_changes: [(limbo_target, change)].into(),
            ..Default::default()
        };
        engine.inner.apply_remote_event(event).await.unwrap();

        let doc = engine.local_store().get_document(&key("stations/b")).await;
        assert!(doc.is_no_document());
        let (active, queued) = engine.limbo_state().await;
        assert!(active.is_empty());
        assert!(queued.is_empty());
    }
}
