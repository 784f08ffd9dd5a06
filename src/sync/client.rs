use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::credentials::{CredentialsProvider, User};
use crate::error::SyncResult;
use crate::local::{LocalPersistence, LocalStore, QueryEngineConfig};
use crate::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::query::Query;
use crate::remote::{Connection, RemoteStoreConfig, WireSerializer};
use crate::sync::event_manager::{ListenOptions, SnapshotListener};
use crate::sync::sync_engine::{ListenerRegistration, SyncEngine, SyncEngineConfig, WriteAck};
use crate::util::{AsyncQueue, DelayedOperation};

/// Tunables for one client instance.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub database_id: DatabaseId,
    pub query_engine: QueryEngineConfig,
    pub remote: RemoteStoreConfig,
    pub sync: SyncEngineConfig,
    /// Cadence of the orphaned-document garbage collector.
    pub gc_interval: Duration,
}

impl ClientConfig {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            query_engine: QueryEngineConfig::default(),
            remote: RemoteStoreConfig::default(),
            sync: SyncEngineConfig::default(),
            gc_interval: Duration::from_secs(300),
        }
    }
}

struct ClientInner {
    engine: SyncEngine,
    queue: AsyncQueue,
    gc_interval: Duration,
    gc_task: StdMutex<Option<DelayedOperation>>,
}

/// Application-facing handle over the synchronization core.
///
/// Every operation is funneled through one ordered work queue, so callers
/// observe their own calls in program order even though the engine itself
/// suspends on network and persistence I/O.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    pub fn new(
        config: ClientConfig,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        persistence: Arc<dyn LocalPersistence>,
    ) -> Self {
        let local_store = Arc::new(LocalStore::with_config(
            persistence,
            User::unauthenticated(),
            config.query_engine,
        ));
        let serializer = WireSerializer::new(config.database_id.clone());
        let engine = SyncEngine::new(
            local_store,
            connection,
            Arc::clone(&credentials),
            serializer,
            config.remote,
            config.sync,
        );

        let inner = Arc::new(ClientInner {
            engine: engine.clone(),
            queue: AsyncQueue::new(),
            gc_interval: config.gc_interval,
            gc_task: StdMutex::new(None),
        });

        // Token changes re-authenticate the streams and swap the active
        // user's queue, in queue order with everything else.
        {
            let engine = engine.clone();
            let queue = inner.queue.clone();
            credentials.set_change_listener(Arc::new(move |user| {
                let engine = engine.clone();
                queue.enqueue(async move {
                    if let Err(err) = engine.handle_credential_change(user).await {
                        log::warn!("credential change failed: {err}");
                    }
                });
            }));
        }

        Self::schedule_gc(&inner);
        Self { inner }
    }

    /// Subscribes to live snapshots of a query.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        listener: SnapshotListener,
    ) -> SyncResult<ListenerRegistration> {
        let engine = self.inner.engine.clone();
        self.inner
            .queue
            .run(async move { engine.listen(query, options, listener).await })
            .await
    }

    /// Enqueues a mutation batch. The local view updates immediately; the
    /// returned ack settles when the server accepts or rejects the batch.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<WriteAck> {
        let engine = self.inner.engine.clone();
        self.inner
            .queue
            .run(async move { engine.write(mutations).await })
            .await
    }

    /// Reads one document from the materialized local view.
    pub async fn get_document(&self, key: DocumentKey) -> SyncResult<MutableDocument> {
        let engine = self.inner.engine.clone();
        self.inner
            .queue
            .run(async move { Ok(engine.local_store().get_document(&key).await) })
            .await
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        let engine = self.inner.engine.clone();
        self.inner
            .queue
            .run(async move { engine.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        let engine = self.inner.engine.clone();
        self.inner
            .queue
            .run(async move { engine.disable_network().await })
            .await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        if let Some(task) = self.inner.gc_task.lock().unwrap().take() {
            task.cancel();
        }
        let engine = self.inner.engine.clone();
        self.inner
            .queue
            .run(async move { engine.shutdown().await })
            .await
    }

    fn schedule_gc(inner: &Arc<ClientInner>) {
        let weak = Arc::downgrade(inner);
        let task = inner.queue.enqueue_after_delay(inner.gc_interval, async move {
            if let Some(inner) = weak.upgrade() {
                let limbo = inner.engine.limbo_keys().await;
                inner.engine.local_store().collect_garbage(&limbo).await;
                SyncClient::schedule_gc(&inner);
            }
        });
        *inner.gc_task.lock().unwrap() = Some(task);
    }
}
