use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::credentials::CredentialsProvider;
use crate::error::{internal_error, SyncError, SyncResult};
use crate::model::{MutationBatch, MutationBatchResult, Timestamp};
use crate::remote::backoff::BackoffConfig;
use crate::remote::listen_stream::{ListenStream, ListenStreamDelegate, WatchTarget};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::serializer::WireSerializer;
use crate::remote::transport::Connection;
use crate::remote::watch_change::{WatchChange, WatchTargetChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::write_stream::{WriteResponse, WriteStream, WriteStreamDelegate};

#[derive(Clone, Copy, Debug)]
pub struct RemoteStoreConfig {
    /// Upper bound on batches in flight on the write stream.
    pub max_pending_writes: usize,
    pub backoff: BackoffConfig,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Why the remote store currently keeps its streams down. The network is
/// usable only while this set is empty; explicit disable signals (user
/// request, app backgrounding) are treated exactly like transport errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

struct SyncerMetadata {
    syncer: Arc<dyn RemoteSyncer>,
}

impl TargetMetadataProvider for SyncerMetadata {
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<crate::model::DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }
}

struct RemoteStoreState {
    listen_targets: BTreeMap<i32, WatchTarget>,
    watch_stream: Option<Arc<ListenStream<WatchDelegate>>>,
    write_stream: Option<Arc<WriteStream<WriteDelegate>>>,
    aggregator: Option<WatchChangeAggregator<SyncerMetadata>>,
    write_pipeline: VecDeque<MutationBatch>,
    last_batch_id: Option<i32>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl Default for RemoteStoreState {
    fn default() -> Self {
        Self {
            listen_targets: BTreeMap::new(),
            watch_stream: None,
            write_stream: None,
            aggregator: None,
            write_pipeline: VecDeque::new(),
            last_batch_id: None,
            offline_causes: BTreeSet::new(),
        }
    }
}

/// Owns the watch and write streams, their reconnect state, and the write
/// pipeline. Queued work survives network loss; disable/enable signals and
/// transport errors both funnel into the same backoff machinery inside the
/// persistent streams.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: WireSerializer,
        syncer: Arc<dyn RemoteSyncer>,
        config: RemoteStoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RemoteStoreInner {
                connection,
                credentials,
                serializer,
                syncer,
                config,
                state: Mutex::new(RemoteStoreState::default()),
            }),
        }
    }

    pub fn serializer(&self) -> &WireSerializer {
        &self.inner.serializer
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
        }
        self.inner.ensure_streams().await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner.go_offline(OfflineCause::UserDisabled).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.go_offline(OfflineCause::Shutdown).await
    }

    /// Registers a listen target; sent immediately when the watch stream is
    /// up, otherwise on the next (re)connect.
    pub async fn listen(&self, target: WatchTarget) -> SyncResult<()> {
        self.inner.listen(target).await
    }

    pub async fn unlisten(&self, target_id: i32) -> SyncResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Polls the mutation queue and pushes batches onto the write stream.
    pub async fn pump_writes(&self) -> SyncResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Tears the streams down and brings them back up with fresh
    /// credentials.
    pub async fn handle_credential_change(&self) -> SyncResult<()> {
        self.inner.go_offline(OfflineCause::CredentialChange).await?;
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::CredentialChange);
        }
        self.inner.ensure_streams().await
    }
}

struct RemoteStoreInner {
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    serializer: WireSerializer,
    syncer: Arc<dyn RemoteSyncer>,
    config: RemoteStoreConfig,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStoreInner {
    fn can_use_network(state: &RemoteStoreState) -> bool {
        state.offline_causes.is_empty()
    }

    async fn go_offline(self: &Arc<Self>, cause: OfflineCause) -> SyncResult<()> {
        let (watch, write) = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(cause);
            state.aggregator = None;
            state.write_pipeline.clear();
            state.last_batch_id = None;
            (state.watch_stream.take(), state.write_stream.take())
        };
        if let Some(stream) = watch {
            stream.stop();
        }
        if let Some(stream) = write {
            stream.stop();
        }
        Ok(())
    }

    async fn ensure_streams(self: &Arc<Self>) -> SyncResult<()> {
        self.start_watch_stream().await?;
        self.fill_write_pipeline().await
    }

    async fn listen(self: &Arc<Self>, target: WatchTarget) -> SyncResult<()> {
        let target_id = target.target_id();
        let stream = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target.clone());
            if !Self::can_use_network(&state) {
                return Ok(());
            }
            state.watch_stream.clone()
        };

        match stream {
            Some(stream) => stream.watch(target).await,
            None => self.start_watch_stream().await,
        }
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32) -> SyncResult<()> {
        let stream = {
            let mut state = self.state.lock().await;
            state.listen_targets.remove(&target_id);
            state.watch_stream.clone()
        };
        if let Some(stream) = stream {
            stream.unwatch(target_id).await?;
        }
        Ok(())
    }

    async fn start_watch_stream(self: &Arc<Self>) -> SyncResult<()> {
        let (stream, targets) = {
            let mut state = self.state.lock().await;
            if !Self::can_use_network(&state)
                || state.watch_stream.is_some()
                || state.listen_targets.is_empty()
            {
                return Ok(());
            }
            state.aggregator = Some(self.new_aggregator());
            let delegate = Arc::new(WatchDelegate {
                inner: Arc::downgrade(self),
            });
            let stream = Arc::new(ListenStream::new(
                Arc::clone(&self.connection),
                Arc::clone(&self.credentials),
                self.serializer.clone(),
                delegate,
                self.config.backoff,
            ));
            state.watch_stream = Some(Arc::clone(&stream));
            let targets = state.listen_targets.values().cloned().collect::<Vec<_>>();
            (stream, targets)
        };

        for target in targets {
            stream.watch(target).await?;
        }
        Ok(())
    }

    fn new_aggregator(self: &Arc<Self>) -> WatchChangeAggregator<SyncerMetadata> {
        WatchChangeAggregator::new(
            Arc::new(SyncerMetadata {
                syncer: Arc::clone(&self.syncer),
            }),
            self.serializer.clone(),
        )
    }

    async fn start_write_stream(self: &Arc<Self>) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if !Self::can_use_network(&state)
            || state.write_stream.is_some()
            || state.write_pipeline.is_empty()
        {
            return Ok(());
        }
        let delegate = Arc::new(WriteDelegate {
            inner: Arc::downgrade(self),
        });
        state.write_stream = Some(Arc::new(WriteStream::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.credentials),
            self.serializer.clone(),
            delegate,
            self.config.backoff,
        )));
        Ok(())
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> SyncResult<()> {
        loop {
            let (should_fetch, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    Self::can_use_network(&state)
                        && state.write_pipeline.len() < self.config.max_pending_writes,
                    state.last_batch_id,
                )
            };
            if !should_fetch {
                break;
            }

            let Some(batch) = self.syncer.next_mutation_batch(last_batch_id).await? else {
                break;
            };
            if batch.mutations.is_empty() {
                break;
            }

            let mutations = batch.mutations.clone();
            let stream = {
                let mut state = self.state.lock().await;
                state.last_batch_id = Some(batch.batch_id);
                state.write_pipeline.push_back(batch);
                state.write_stream.clone()
            };

            match stream {
                Some(stream) => {
                    if stream.handshake_complete().await {
                        stream.write(&mutations).await?;
                    }
                }
                None => self.start_write_stream().await?,
            }
        }
        Ok(())
    }

    async fn on_watch_change(self: &Arc<Self>, change: WatchChange) -> SyncResult<()> {
        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(error) = target_change.cause.clone() {
                return self.handle_target_error(target_change.clone(), error).await;
            }
        }

        let event = {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.aggregator.as_mut() else {
                return Ok(());
            };
            if let Some(version) = snapshot_version_for_change(&change) {
                aggregator.set_snapshot_version(Some(version));
            }
            aggregator.handle_watch_change(change)?;
            aggregator.drain()
        };

        if event.is_empty() {
            return Ok(());
        }

        {
            // Refresh stored resume tokens so reconnects resume where the
            // server left off.
            let mut state = self.state.lock().await;
            for (target_id, change) in &event.target_changes {
                if let Some(token) = &change.resume_token {
                    if let Some(target) = state.listen_targets.get_mut(target_id) {
                        target.update_resume_token(token);
                    }
                }
            }
        }

        let resets: Vec<i32> = event.target_resets.iter().copied().collect();
        if !resets.is_empty() {
            self.handle_target_resets(&resets).await?;
        }
        self.syncer.apply_remote_event(event).await
    }

    /// Existence-filter mismatches and server resets re-subscribe the
    /// target from scratch instead of patching it incrementally.
    async fn handle_target_resets(self: &Arc<Self>, target_ids: &[i32]) -> SyncResult<()> {
        let (stream, targets) = {
            let mut state = self.state.lock().await;
            let mut targets = Vec::new();
            for target_id in target_ids {
                if let Some(target) = state.listen_targets.get_mut(target_id) {
                    target.clear_resume_token();
                    targets.push((*target_id, target.clone()));
                }
            }
            (state.watch_stream.clone(), targets)
        };

        if let Some(stream) = stream {
            for (target_id, target) in targets {
                stream.unwatch(target_id).await?;
                stream.watch(target).await?;
            }
        }
        Ok(())
    }

    async fn handle_target_error(
        self: &Arc<Self>,
        change: WatchTargetChange,
        error: SyncError,
    ) -> SyncResult<()> {
        for target_id in change.target_ids {
            let known = {
                let mut state = self.state.lock().await;
                state.listen_targets.remove(&target_id).is_some()
            };
            if known {
                self.syncer.reject_listen(target_id, error.clone()).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_error(self: &Arc<Self>, error: SyncError) {
        // The persistent stream reconnects on its own; discard the partial
        // aggregation so the new connection starts from tracked state.
        let mut state = self.state.lock().await;
        if state.watch_stream.is_some() {
            state.aggregator = Some(self.new_aggregator());
        }
        log::warn!("watch stream error: {error}");
    }

    async fn on_write_handshake_complete(self: &Arc<Self>) -> SyncResult<()> {
        // The server deduplicates resent batches by content; everything
        // still unacknowledged goes out again in original order.
        let (stream, batches) = {
            let state = self.state.lock().await;
            (
                state.write_stream.clone(),
                state
                    .write_pipeline
                    .iter()
                    .map(|batch| batch.mutations.clone())
                    .collect::<Vec<_>>(),
            )
        };
        if let Some(stream) = stream {
            for mutations in batches {
                stream.write(&mutations).await?;
            }
        }
        Ok(())
    }

    async fn on_write_response(self: &Arc<Self>, response: WriteResponse) -> SyncResult<()> {
        let batch = {
            let mut state = self.state.lock().await;
            state
                .write_pipeline
                .pop_front()
                .ok_or_else(|| internal_error("write response without a pending batch"))?
        };

        if response.results.len() != batch.mutations.len() {
            return Err(internal_error(format!(
                "server returned {} results for a batch of {} mutations",
                response.results.len(),
                batch.mutations.len()
            )));
        }

        let result = MutationBatchResult::new(
            batch,
            response.commit_version.unwrap_or(Timestamp::ZERO),
            response.results,
        );
        self.syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_error(self: &Arc<Self>, error: SyncError) {
        if !error.is_permanent_write_rejection() {
            // Transient: the stream reconnects and the pipeline is resent
            // after the next handshake.
            log::warn!("write stream error (will retry): {error}");
            return;
        }

        let batch = {
            let mut state = self.state.lock().await;
            state.write_pipeline.pop_front()
        };
        match batch {
            Some(batch) => {
                log::warn!("write batch {} rejected: {error}", batch.batch_id);
                if let Err(err) = self
                    .syncer
                    .reject_failed_write(batch.batch_id, error)
                    .await
                {
                    log::warn!("failed to apply write rejection: {err}");
                }
                if let Err(err) = self.fill_write_pipeline().await {
                    log::warn!("failed to refill write pipeline: {err}");
                }
            }
            None => log::warn!("write stream error with empty pipeline: {error}"),
        }
    }
}

struct WatchDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl ListenStreamDelegate for WatchDelegate {
    async fn on_watch_change(&self, change: WatchChange) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_change(change).await,
            None => Ok(()),
        }
    }

    async fn on_stream_error(&self, error: SyncError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_error(error).await;
        }
    }
}

struct WriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamDelegate for WriteDelegate {
    async fn on_handshake_complete(&self) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_write_response(&self, response: WriteResponse) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_response(response).await,
            None => Ok(()),
        }
    }

    async fn on_stream_error(&self, error: SyncError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_error(error).await;
        }
    }
}

fn snapshot_version_for_change(change: &WatchChange) -> Option<Timestamp> {
    match change {
        WatchChange::TargetChange(change) => change.read_time,
        WatchChange::DocumentDelete(delete) => delete.read_time,
        WatchChange::DocumentRemove(remove) => remove.read_time,
        _ => None,
    }
}
