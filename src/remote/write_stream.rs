use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::credentials::{AuthToken, CredentialsProvider};
use crate::error::{failed_precondition, internal_error, SyncError, SyncResult};
use crate::model::{Mutation, MutationResult, Timestamp};
use crate::remote::backoff::BackoffConfig;
use crate::remote::serializer::WireSerializer;
use crate::remote::stream::{
    PersistentStream, PersistentStreamHandle, StreamHandler, StreamKind, StreamState,
};
use crate::remote::transport::{Connection, StreamHandle};

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_handshake_complete(&self) -> SyncResult<()>;
    async fn on_write_response(&self, response: WriteResponse) -> SyncResult<()>;
    async fn on_stream_error(&self, error: SyncError);
}

/// Server response to one write request (or to the handshake, which carries
/// no results).
#[derive(Clone, Debug)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: Option<Timestamp>,
    pub results: Vec<MutationResult>,
}

/// Write stream: submits mutation batches in queue order and receives
/// per-mutation results. The first response establishes the stream token
/// that must be echoed on every subsequent send; a response without a token
/// means the client and server no longer agree on the stream state, which
/// is fatal.
pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    handler: Arc<WriteStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
{
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: WireSerializer,
        delegate: Arc<D>,
        backoff: BackoffConfig,
    ) -> Self {
        let handler = Arc::new(WriteStreamHandler::new(serializer, delegate));
        let handle = PersistentStream::new(connection, credentials, StreamKind::Write, backoff)
            .start(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn write(&self, mutations: &[Mutation]) -> SyncResult<()> {
        self.handler.write_mutations(mutations).await
    }

    pub async fn handshake_complete(&self) -> bool {
        self.handler.state.lock().await.handshake_complete
    }

    pub fn stop(&self) {
        self.handler.stop();
        self.handle.stop();
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }
}

struct WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    serializer: WireSerializer,
    delegate: Arc<D>,
    state: Mutex<WriteStreamState>,
    running: AtomicBool,
}

#[derive(Default)]
struct WriteStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    handshake_complete: bool,
    last_stream_token: Option<Vec<u8>>,
}

impl<D> WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn new(serializer: WireSerializer, delegate: Arc<D>) -> Self {
        Self {
            serializer,
            delegate,
            state: Mutex::new(WriteStreamState::default()),
            running: AtomicBool::new(true),
        }
    }

    async fn write_mutations(&self, mutations: &[Mutation]) -> SyncResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let (stream, stream_token) = {
            let guard = self.state.lock().await;
            if !guard.handshake_complete {
                return Err(failed_precondition(
                    "cannot send writes before the handshake completes",
                ));
            }
            let stream = guard
                .stream
                .clone()
                .ok_or_else(|| internal_error("write stream is not open"))?;
            let token = guard
                .last_stream_token
                .clone()
                .ok_or_else(|| internal_error("write stream token missing after handshake"))?;
            (stream, token)
        };

        let writes = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect::<SyncResult<Vec<_>>>()?;
        let request = json!({
            "database": self.serializer.database_name(),
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        });
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("failed to encode write request: {err}")))?;
        stream.send(bytes).await
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<D> StreamHandler for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn label(&self) -> &'static str {
        "write"
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn on_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        _token: Option<AuthToken>,
    ) -> SyncResult<()> {
        {
            let mut guard = self.state.lock().await;
            guard.stream = Some(Arc::clone(&stream));
            guard.handshake_complete = false;
            guard.last_stream_token = None;
        }
        let handshake = json!({ "database": self.serializer.database_name() });
        let bytes = serde_json::to_vec(&handshake)
            .map_err(|err| internal_error(format!("failed to encode handshake: {err}")))?;
        stream.send(bytes).await
    }

    async fn on_message(&self, payload: Vec<u8>) -> SyncResult<()> {
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("failed to decode write response: {err}")))?;
        let response = decode_write_response(&self.serializer, &value)?;

        let first_response = {
            let mut guard = self.state.lock().await;
            guard.last_stream_token = Some(response.stream_token.clone());
            if guard.handshake_complete {
                false
            } else {
                guard.handshake_complete = true;
                true
            }
        };

        if first_response {
            self.delegate.on_handshake_complete().await
        } else {
            self.delegate.on_write_response(response).await
        }
    }

    async fn on_close(&self) {
        let mut guard = self.state.lock().await;
        guard.stream = None;
        guard.handshake_complete = false;
        guard.last_stream_token = None;
    }

    async fn on_error(&self, error: SyncError) {
        {
            let mut guard = self.state.lock().await;
            guard.stream = None;
            guard.handshake_complete = false;
        }
        self.delegate.on_stream_error(error).await;
    }
}

fn decode_write_response(
    serializer: &WireSerializer,
    value: &JsonValue,
) -> SyncResult<WriteResponse> {
    let stream_token = value
        .get("streamToken")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| internal_error("write response is missing its stream token"))
        .and_then(|token| {
            BASE64_STANDARD
                .decode(token)
                .map_err(|err| internal_error(format!("invalid stream token: {err}")))
        })?;

    let commit_version = value
        .get("commitTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?;

    let results = value
        .get("writeResults")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| decode_write_result(serializer, entry, commit_version))
                .collect::<SyncResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(WriteResponse {
        stream_token,
        commit_version,
        results,
    })
}

fn decode_write_result(
    serializer: &WireSerializer,
    value: &JsonValue,
    commit_version: Option<Timestamp>,
) -> SyncResult<MutationResult> {
    let version = value
        .get("updateTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?
        .or(commit_version)
        .unwrap_or(Timestamp::ZERO);

    let transform_results = value
        .get("transformResults")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| serializer.decode_value(entry))
                .collect::<SyncResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(MutationResult {
        version,
        transform_results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseId;
    use crate::value::FieldValue;

    fn serializer() -> WireSerializer {
        WireSerializer::new(DatabaseId::new("volt-app", "(default)"))
    }

    #[test]
    fn response_without_token_is_fatal() {
        let err = decode_write_response(&serializer(), &json!({ "writeResults": [] })).unwrap_err();
        assert_eq!(err.code_str(), "gridbase/internal");
    }

    #[test]
    fn decodes_results_with_transforms() {
        let value = json!({
            "streamToken": BASE64_STANDARD.encode([9u8]),
            "commitTime": "2024-05-01T00:00:00Z",
            "writeResults": [
                {
                    "updateTime": "2024-05-01T00:00:00Z",
                    "transformResults": [ { "integerValue": "7" } ],
                }
            ],
        });
        let response = decode_write_response(&serializer(), &value).unwrap();
        assert_eq!(response.stream_token, vec![9]);
        assert_eq!(response.results.len(), 1);
        assert_eq!(
            response.results[0].transform_results[0],
            FieldValue::from_integer(7)
        );
        assert!(!response.results[0].version.is_zero());
    }

    #[test]
    fn result_version_falls_back_to_commit_time() {
        let value = json!({
            "streamToken": BASE64_STANDARD.encode([9u8]),
            "commitTime": "2024-05-01T00:00:00Z",
            "writeResults": [ {} ],
        });
        let response = decode_write_response(&serializer(), &value).unwrap();
        assert_eq!(response.results[0].version, response.commit_version.unwrap());
    }
}
