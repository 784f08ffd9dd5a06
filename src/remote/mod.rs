pub mod backoff;
pub mod bloom_filter;
pub mod listen_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod transport;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod write_stream;

pub use backoff::{Backoff, BackoffConfig};
pub use bloom_filter::BloomFilter;
pub use listen_stream::{ListenStream, ListenStreamDelegate, TargetPayload, WatchTarget};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, RemoteStoreConfig};
pub use remote_syncer::RemoteSyncer;
pub use serializer::WireSerializer;
pub use stream::{PersistentStream, PersistentStreamHandle, StreamHandler, StreamKind, StreamState};
pub use transport::{
    Connection, FrameKind, InMemoryTransport, MultiplexedConnection, MultiplexedStream,
    StreamHandle, StreamId, StreamTransport, TransportFrame,
};
pub use watch_change::{decode_watch_change, ExistenceFilterChange, WatchChange};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
pub use write_stream::{WriteResponse, WriteStream, WriteStreamDelegate};
