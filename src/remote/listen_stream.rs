use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::credentials::{AuthToken, CredentialsProvider};
use crate::error::{internal_error, SyncError, SyncResult};
use crate::model::DocumentKey;
use crate::query::Query;
use crate::remote::backoff::BackoffConfig;
use crate::remote::serializer::WireSerializer;
use crate::remote::stream::{
    PersistentStream, PersistentStreamHandle, StreamHandler, StreamKind, StreamState,
};
use crate::remote::transport::{Connection, StreamHandle};
use crate::remote::watch_change::{decode_watch_change, WatchChange};

#[async_trait]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    async fn on_watch_change(&self, change: WatchChange) -> SyncResult<()>;
    async fn on_stream_error(&self, error: SyncError);
}

/// A server-side subscription the watch stream maintains: a query or a set
/// of individual documents, plus the resume token used after reconnects.
#[derive(Clone, Debug)]
pub struct WatchTarget {
    target_id: i32,
    payload: TargetPayload,
    resume_token: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub enum TargetPayload {
    Query {
        parent: String,
        structured_query: JsonValue,
    },
    Documents {
        documents: Vec<String>,
    },
}

impl WatchTarget {
    pub fn for_query(
        serializer: &WireSerializer,
        target_id: i32,
        query: &Query,
    ) -> SyncResult<Self> {
        Ok(Self {
            target_id,
            payload: TargetPayload::Query {
                parent: serializer.query_parent(query),
                structured_query: serializer.encode_structured_query(query)?,
            },
            resume_token: None,
        })
    }

    /// Single-document target used for limbo resolution.
    pub fn for_document(serializer: &WireSerializer, target_id: i32, key: &DocumentKey) -> Self {
        Self {
            target_id,
            payload: TargetPayload::Documents {
                documents: vec![serializer.document_name(key)],
            },
            resume_token: None,
        }
    }

    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn with_resume_token(mut self, token: Vec<u8>) -> Self {
        if !token.is_empty() {
            self.resume_token = Some(token);
        }
        self
    }

    pub fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.resume_token = Some(token.to_vec());
        }
    }

    /// Dropped after a target reset; the next listen starts from scratch.
    pub fn clear_resume_token(&mut self) {
        self.resume_token = None;
    }

    pub fn resume_token(&self) -> Option<&[u8]> {
        self.resume_token.as_deref()
    }
}

/// Watch stream: subscribes to targets and receives incremental
/// add/remove/current notifications. On reconnect every tracked target is
/// re-issued with its last resume token rather than from scratch.
pub struct ListenStream<D>
where
    D: ListenStreamDelegate,
{
    handler: Arc<ListenStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> ListenStream<D>
where
    D: ListenStreamDelegate,
{
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: WireSerializer,
        delegate: Arc<D>,
        backoff: BackoffConfig,
    ) -> Self {
        let handler = Arc::new(ListenStreamHandler::new(serializer, delegate));
        let handle = PersistentStream::new(connection, credentials, StreamKind::Listen, backoff)
            .start(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn watch(&self, target: WatchTarget) -> SyncResult<()> {
        self.handler.watch(target).await
    }

    pub async fn unwatch(&self, target_id: i32) -> SyncResult<()> {
        self.handler.unwatch(target_id).await
    }

    pub fn stop(&self) {
        self.handler.stop();
        self.handle.stop();
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }
}

struct ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    serializer: WireSerializer,
    delegate: Arc<D>,
    state: Mutex<ListenStreamState>,
    running: AtomicBool,
}

#[derive(Default)]
struct ListenStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    targets: BTreeMap<i32, WatchTarget>,
}

impl<D> ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn new(serializer: WireSerializer, delegate: Arc<D>) -> Self {
        Self {
            serializer,
            delegate,
            state: Mutex::new(ListenStreamState::default()),
            running: AtomicBool::new(true),
        }
    }

    async fn watch(&self, target: WatchTarget) -> SyncResult<()> {
        let request = encode_watch_request(&self.serializer, &target)?;
        let stream = {
            let mut guard = self.state.lock().await;
            guard.targets.insert(target.target_id, target);
            guard.stream.clone()
        };
        if let Some(stream) = stream {
            send_json(&stream, &request).await?;
        }
        Ok(())
    }

    async fn unwatch(&self, target_id: i32) -> SyncResult<()> {
        let request = json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        });
        let stream = {
            let mut guard = self.state.lock().await;
            guard.targets.remove(&target_id);
            guard.stream.clone()
        };
        if let Some(stream) = stream {
            send_json(&stream, &request).await?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<D> StreamHandler for ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn label(&self) -> &'static str {
        "listen"
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn on_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        _token: Option<AuthToken>,
    ) -> SyncResult<()> {
        let targets = {
            let mut guard = self.state.lock().await;
            guard.stream = Some(Arc::clone(&stream));
            guard.targets.values().cloned().collect::<Vec<_>>()
        };
        for target in targets {
            let request = encode_watch_request(&self.serializer, &target)?;
            send_json(&stream, &request).await?;
        }
        Ok(())
    }

    async fn on_message(&self, payload: Vec<u8>) -> SyncResult<()> {
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("failed to decode watch message: {err}")))?;
        let Some(change) = decode_watch_change(&self.serializer, &value)? else {
            return Ok(());
        };

        // Keep each target's resume token fresh so a reconnect resumes
        // rather than restarting.
        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(token) = &target_change.resume_token {
                if !token.is_empty() {
                    let mut guard = self.state.lock().await;
                    if target_change.target_ids.is_empty() {
                        for target in guard.targets.values_mut() {
                            target.resume_token = Some(token.clone());
                        }
                    } else {
                        for target_id in &target_change.target_ids {
                            if let Some(target) = guard.targets.get_mut(target_id) {
                                target.resume_token = Some(token.clone());
                            }
                        }
                    }
                }
            }
        }

        self.delegate.on_watch_change(change).await
    }

    async fn on_close(&self) {
        let mut guard = self.state.lock().await;
        guard.stream = None;
    }

    async fn on_error(&self, error: SyncError) {
        {
            let mut guard = self.state.lock().await;
            guard.stream = None;
        }
        self.delegate.on_stream_error(error).await;
    }
}

fn encode_watch_request(serializer: &WireSerializer, target: &WatchTarget) -> SyncResult<JsonValue> {
    let mut add_target = serde_json::Map::new();
    add_target.insert("targetId".to_string(), json!(target.target_id));
    if let Some(token) = target.resume_token() {
        add_target.insert(
            "resumeToken".to_string(),
            json!(BASE64_STANDARD.encode(token)),
        );
    }
    match &target.payload {
        TargetPayload::Query {
            parent,
            structured_query,
        } => {
            add_target.insert(
                "query".to_string(),
                json!({ "parent": parent, "structuredQuery": structured_query }),
            );
        }
        TargetPayload::Documents { documents } => {
            add_target.insert("documents".to_string(), json!({ "documents": documents }));
        }
    }
    Ok(json!({
        "database": serializer.database_name(),
        "addTarget": JsonValue::Object(add_target),
    }))
}

async fn send_json(stream: &Arc<dyn StreamHandle>, request: &JsonValue) -> SyncResult<()> {
    let bytes = serde_json::to_vec(request)
        .map_err(|err| internal_error(format!("failed to encode listen request: {err}")))?;
    stream.send(bytes).await
}
