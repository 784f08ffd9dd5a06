//! End-to-end scenarios driving the full stack (client, sync engine, local
//! store, streams) against a scripted server on the loopback transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use gridbase_sync::credentials::AnonymousCredentials;
use gridbase_sync::error::{failed_precondition, SyncError};
use gridbase_sync::local::MemoryPersistence;
use gridbase_sync::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, Mutation, Precondition, ResourcePath,
};
use gridbase_sync::query::Query;
use gridbase_sync::remote::{
    FrameKind, InMemoryTransport, MultiplexedConnection, StreamId, StreamTransport, TransportFrame,
};
use gridbase_sync::sync::{ClientConfig, ListenOptions, SnapshotListener, SyncClient, ViewSnapshot};
use gridbase_sync::value::{FieldValue, MapValue};

const DOC_PREFIX: &str = "projects/volt-app/databases/(default)/documents";

fn client_pair() -> (SyncClient, Arc<InMemoryTransport>) {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let connection = Arc::new(MultiplexedConnection::new(client_transport));
    let client = SyncClient::new(
        ClientConfig::new(DatabaseId::new("volt-app", "(default)")),
        connection,
        Arc::new(AnonymousCredentials),
        Arc::new(MemoryPersistence),
    );
    (client, server_transport)
}

async fn next_data(transport: &Arc<InMemoryTransport>) -> (StreamId, JsonValue) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let frame = transport.next().await.expect("transport open");
            if let FrameKind::Data(bytes) = frame.kind {
                let value = serde_json::from_slice(&bytes).expect("json payload");
                return (frame.stream_id, value);
            }
        }
    })
    .await
    .expect("server frame within deadline")
}

async fn send_json(transport: &Arc<InMemoryTransport>, stream_id: StreamId, value: JsonValue) {
    transport
        .send(TransportFrame {
            stream_id,
            kind: FrameKind::Data(serde_json::to_vec(&value).expect("encode")),
        })
        .await
        .expect("server send");
}

async fn send_error(transport: &Arc<InMemoryTransport>, stream_id: StreamId, error: SyncError) {
    transport
        .send(TransportFrame {
            stream_id,
            kind: FrameKind::Error(error),
        })
        .await
        .expect("server send error");
}

fn stations_query() -> Query {
    Query::collection(ResourcePath::from_string("stations").unwrap())
}

fn recorder() -> (SnapshotListener, Arc<Mutex<Vec<ViewSnapshot>>>) {
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&snapshots);
    (
        SnapshotListener::new(move |snapshot| {
            seen.lock().unwrap().push(snapshot);
        }),
        snapshots,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}

fn document_change(path: &str, kwh: i64, update_time: &str) -> JsonValue {
    json!({
        "documentChange": {
            "document": {
                "name": format!("{DOC_PREFIX}/{path}"),
                "fields": { "kwh": { "integerValue": kwh.to_string() } },
                "updateTime": update_time,
            },
            "targetIds": [2],
        }
    })
}

fn current_marker(resume_token: &[u8], read_time: &str) -> JsonValue {
    json!({
        "targetChange": {
            "targetIds": [],
            "targetChangeType": "CURRENT",
            "resumeToken": BASE64_STANDARD.encode(resume_token),
            "readTime": read_time,
        }
    })
}

#[tokio::test]
async fn listen_receives_server_documents_and_becomes_current() {
    let (client, server) = client_pair();
    let (listener, snapshots) = recorder();

    let _registration = client
        .listen(stations_query(), ListenOptions::default(), listener)
        .await
        .expect("listen");

    let (listen_sid, request) = next_data(&server).await;
    assert_eq!(
        request.get("addTarget").and_then(|t| t.get("targetId")),
        Some(&json!(2))
    );

    send_json(
        &server,
        listen_sid,
        document_change("stations/a", 30, "2024-05-01T00:00:00Z"),
    )
    .await;
    send_json(
        &server,
        listen_sid,
        current_marker(&[1, 2, 3], "2024-05-01T00:00:01Z"),
    )
    .await;

    wait_until(|| {
        snapshots
            .lock()
            .unwrap()
            .iter()
            .any(|snapshot| !snapshot.from_cache)
    })
    .await;

    let snapshots = snapshots.lock().unwrap();
    let last = snapshots.last().unwrap();
    assert_eq!(last.documents.len(), 1);
    assert_eq!(last.documents[0].key().id(), "a");
    assert!(!last.from_cache);
    assert!(!last.has_pending_writes);
}

#[tokio::test]
async fn offline_write_is_pending_until_server_ack() {
    let (client, server) = client_pair();
    let (listener, snapshots) = recorder();

    client.disable_network().await.expect("disable");
    let _registration = client
        .listen(stations_query(), ListenOptions::default(), listener)
        .await
        .expect("listen");

    let key = DocumentKey::from_string("stations/new").unwrap();
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("kwh".to_string(), FieldValue::from_integer(50));
    let ack = client
        .write(vec![Mutation::set(key.clone(), MapValue::new(fields))])
        .await
        .expect("write enqueued");

    // The optimistic write is visible immediately, flagged as pending.
    let doc = client.get_document(key.clone()).await.expect("read");
    assert!(doc.has_pending_writes());
    wait_until(|| {
        snapshots
            .lock()
            .unwrap()
            .iter()
            .any(|snapshot| snapshot.has_pending_writes && snapshot.documents.len() == 1)
    })
    .await;

    client.enable_network().await.expect("enable");

    // The server answers the watch subscription, the write handshake, and
    // finally the queued batch.
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                let (sid, message) = next_data(&server).await;
                if message.get("addTarget").is_some() {
                    continue;
                }
                if message.get("writes").is_some() {
                    send_json(
                        &server,
                        sid,
                        json!({
                            "streamToken": BASE64_STANDARD.encode([2u8]),
                            "commitTime": "2024-05-02T00:00:00Z",
                            "writeResults": [ { "updateTime": "2024-05-02T00:00:00Z" } ],
                        }),
                    )
                    .await;
                    break;
                }
                if message.get("database").is_some() {
                    // Write stream handshake.
                    send_json(
                        &server,
                        sid,
                        json!({ "streamToken": BASE64_STANDARD.encode([1u8]) }),
                    )
                    .await;
                }
            }
        })
    };

    ack.wait().await.expect("server acknowledged batch");
    server_task.await.expect("server task");

    let doc = client.get_document(key).await.expect("read after ack");
    assert!(!doc.has_pending_writes());
    assert!(!doc.version().is_zero());
}

#[tokio::test]
async fn rejected_precondition_rolls_back_to_server_state() {
    let (client, server) = client_pair();
    let (listener, snapshots) = recorder();

    let _registration = client
        .listen(stations_query(), ListenOptions::default(), listener)
        .await
        .expect("listen");

    // Initial sync: the document exists.
    let (listen_sid, _add_target) = next_data(&server).await;
    send_json(
        &server,
        listen_sid,
        document_change("stations/a", 10, "2024-05-01T00:00:00Z"),
    )
    .await;
    send_json(
        &server,
        listen_sid,
        current_marker(&[1], "2024-05-01T00:00:01Z"),
    )
    .await;
    wait_until(|| snapshots.lock().unwrap().iter().any(|s| !s.from_cache)).await;

    client.disable_network().await.expect("disable");

    // Patch the document while offline; the server meanwhile deleted it.
    let key = DocumentKey::from_string("stations/a").unwrap();
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("kwh".to_string(), FieldValue::from_integer(99));
    let mask = FieldMask::new(vec![FieldPath::from_dot_separated("kwh").unwrap()]);
    let ack = client
        .write(vec![Mutation::patch(key.clone(), MapValue::new(fields), mask)
            .with_precondition(Precondition::Exists(true))])
        .await
        .expect("write enqueued");

    let doc = client.get_document(key.clone()).await.expect("read");
    assert!(doc.has_pending_writes());
    assert_eq!(
        doc.field(&FieldPath::from_dot_separated("kwh").unwrap()),
        Some(&FieldValue::from_integer(99))
    );

    client.enable_network().await.expect("enable");

    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                let (sid, message) = next_data(&server).await;
                if message.get("addTarget").is_some() {
                    // Reconnected watch: report the deletion.
                    send_json(
                        &server,
                        sid,
                        json!({
                            "documentDelete": {
                                "document": format!("{DOC_PREFIX}/stations/a"),
                                "readTime": "2024-05-03T00:00:00Z",
                            }
                        }),
                    )
                    .await;
                    send_json(&server, sid, current_marker(&[9], "2024-05-03T00:00:01Z"))
                        .await;
                    continue;
                }
                if message.get("writes").is_some() {
                    send_error(&server, sid, failed_precondition("document does not exist"))
                        .await;
                    break;
                }
                if message.get("database").is_some() {
                    send_json(
                        &server,
                        sid,
                        json!({ "streamToken": BASE64_STANDARD.encode([1u8]) }),
                    )
                    .await;
                }
            }
        })
    };

    let err = ack.wait().await.expect_err("write must be rejected");
    assert_eq!(err.code_str(), "gridbase/failed-precondition");
    server_task.await.expect("server task");

    // The overlay is gone and the watch delete lands: the local view
    // reverts to "no document".
    let mut reverted = false;
    for _ in 0..100 {
        let doc = client.get_document(key.clone()).await.expect("read");
        if doc.is_no_document() && !doc.has_pending_writes() {
            reverted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reverted, "local view reverts to the server-reported deletion");
}

#[tokio::test]
async fn watch_stream_resumes_with_stored_token_after_error() {
    let (client, server) = client_pair();
    let (listener, snapshots) = recorder();

    let _registration = client
        .listen(stations_query(), ListenOptions::default(), listener)
        .await
        .expect("listen");

    let (listen_sid, first_request) = next_data(&server).await;
    assert!(first_request
        .get("addTarget")
        .map(|t| t.get("resumeToken").is_none())
        .unwrap_or(false));

    send_json(
        &server,
        listen_sid,
        document_change("stations/a", 30, "2024-05-01T00:00:00Z"),
    )
    .await;
    send_json(
        &server,
        listen_sid,
        current_marker(&[7, 7], "2024-05-01T00:00:01Z"),
    )
    .await;
    wait_until(|| snapshots.lock().unwrap().iter().any(|s| !s.from_cache)).await;

    // Break the stream; the client must re-subscribe using the stored
    // resume token instead of starting from scratch.
    send_error(
        &server,
        listen_sid,
        gridbase_sync::error::unavailable("stream reset"),
    )
    .await;

    let (_new_sid, request) = next_data(&server).await;
    let add_target = request.get("addTarget").expect("re-listen after error");
    assert_eq!(
        add_target.get("resumeToken"),
        Some(&json!(BASE64_STANDARD.encode([7u8, 7])))
    );
}
