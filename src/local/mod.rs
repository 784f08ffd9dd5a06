mod local_documents;
pub mod local_store;
pub mod mutation_queue;
pub mod overlay_cache;
pub mod persistence;
pub mod query_engine;
pub mod remote_document_cache;
pub mod target_cache;

pub use local_store::{LocalStore, LocalWriteResult, QueryExecutionResult};
pub use mutation_queue::MutationQueue;
pub use overlay_cache::DocumentOverlayCache;
pub use persistence::{LocalPersistence, MemoryPersistence, PersistedState};
pub use query_engine::{IndexManager, QueryEngine, QueryEngineConfig};
pub use remote_document_cache::RemoteDocumentCache;
pub use target_cache::{TargetCache, TargetIdGenerator, TargetState};
