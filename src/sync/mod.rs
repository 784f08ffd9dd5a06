pub mod client;
pub mod event_manager;
pub mod sync_engine;
pub mod view;

pub use client::{ClientConfig, SyncClient};
pub use event_manager::{EventManager, ListenOptions, SnapshotListener};
pub use sync_engine::{ListenerRegistration, SyncEngine, SyncEngineConfig, WriteAck};
pub use view::{
    apply_changes, DocumentChangeType, DocumentViewChange, LimboDocumentChange, View, ViewChange,
    ViewSnapshot,
};
