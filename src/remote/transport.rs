use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, SyncError, SyncResult};
use crate::util::runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// One frame on the duplex transport: streams open, carry payloads, and
/// close (cleanly or with an error).
#[derive(Clone, Debug)]
pub enum FrameKind {
    Open,
    Data(Vec<u8>),
    Close,
    Error(SyncError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
}

/// Abstract duplex frame pipe. The concrete wire framing (HTTP streaming,
/// websockets, ...) lives behind this trait.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> SyncResult<()>;
    async fn next(&self) -> SyncResult<TransportFrame>;
}

/// One logical message stream carried over a [`Connection`].
#[async_trait]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()>;
    /// `None` signals a clean close.
    async fn next(&self) -> Option<SyncResult<Vec<u8>>>;
    async fn close(&self) -> SyncResult<()>;
}

/// Opens the per-RPC streams the remote store drives.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(&self) -> SyncResult<Arc<dyn StreamHandle>>;
    async fn open_write_stream(&self) -> SyncResult<Arc<dyn StreamHandle>>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Multiplexes many logical streams over one [`StreamTransport`].
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded::<TransportFrame>();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

        {
            let transport = Arc::clone(&transport);
            runtime::spawn_detached(async move {
                while let Ok(frame) = outbound_rx.recv().await {
                    if let Err(err) = transport.send(frame).await {
                        log::warn!("transport outbound loop terminated: {err}");
                        break;
                    }
                }
            });
        }

        {
            let transport = Arc::clone(&transport);
            let streams = Arc::clone(&streams);
            runtime::spawn_detached(async move {
                loop {
                    match transport.next().await {
                        Ok(frame) => {
                            let sender = streams.lock().unwrap().get(&frame.stream_id).cloned();
                            let Some(sender) = sender else {
                                log::debug!(
                                    "dropping frame for unknown stream {}",
                                    frame.stream_id.value()
                                );
                                continue;
                            };
                            let terminal =
                                matches!(frame.kind, FrameKind::Close | FrameKind::Error(_));
                            let _ = sender.send(frame.kind).await;
                            if terminal {
                                streams.lock().unwrap().remove(&frame.stream_id);
                            }
                        }
                        Err(err) => {
                            log::warn!("transport inbound loop terminated: {err}");
                            break;
                        }
                    }
                }
            });
        }

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
        }
    }

    pub async fn open_stream(&self) -> SyncResult<MultiplexedStream> {
        let stream_id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        self.streams.lock().unwrap().insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame {
                stream_id,
                kind: FrameKind::Open,
            })
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            streams: Arc::clone(&self.streams),
        })
    }
}

#[async_trait]
impl Connection for MultiplexedConnection {
    async fn open_listen_stream(&self) -> SyncResult<Arc<dyn StreamHandle>> {
        Ok(Arc::new(self.open_stream().await?))
    }

    async fn open_write_stream(&self) -> SyncResult<Arc<dyn StreamHandle>> {
        Ok(Arc::new(self.open_stream().await?))
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamTable,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }
}

#[async_trait]
impl StreamHandle for MultiplexedStream {
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(TransportFrame {
                stream_id: self.id,
                kind: FrameKind::Data(payload),
            })
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    async fn next(&self) -> Option<SyncResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open => continue,
            }
        }
        None
    }

    async fn close(&self) -> SyncResult<()> {
        self.streams.lock().unwrap().remove(&self.id);
        self.outbound
            .send(TransportFrame {
                stream_id: self.id,
                kind: FrameKind::Close,
            })
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.streams.lock().unwrap().remove(&self.id);
        let _ = self.outbound.try_send(TransportFrame {
            stream_id: self.id,
            kind: FrameKind::Close,
        });
    }
}

/// Loopback transport pair; one side plays the client, the other the server.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();
        (
            Arc::new(Self {
                inbound: left_rx,
                outbound: right_tx,
            }),
            Arc::new(Self {
                inbound: right_rx,
                outbound: left_tx,
            }),
        )
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> SyncResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| internal_error(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> SyncResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| internal_error(format!("loopback transport recv failed: {err}")))
    }
}
