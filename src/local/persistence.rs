use std::collections::BTreeMap;

use crate::credentials::User;
use crate::error::SyncResult;
use crate::local::target_cache::TargetState;
use crate::model::{DocumentKey, MutableDocument, MutationBatch, Overlay};

/// Durable write-through hooks backing the local caches.
///
/// Implementations provide atomic, per-call durability; the store invokes
/// every hook while holding its own lock, so implementations never see
/// concurrent writers (the single-writer contract). A hook may signal
/// contention with a retryable storage error (`SyncError::is_retryable_
/// storage_error`); the store retries once and then degrades to memory-only
/// operation.
pub trait LocalPersistence: Send + Sync + 'static {
    fn save_mutation_batch(&self, _user: &User, _batch: &MutationBatch) -> SyncResult<()> {
        Ok(())
    }

    fn remove_mutation_batch(&self, _user: &User, _batch_id: i32) -> SyncResult<()> {
        Ok(())
    }

    fn save_overlay(&self, _user: &User, _overlay: &Overlay) -> SyncResult<()> {
        Ok(())
    }

    fn remove_overlay(&self, _user: &User, _key: &DocumentKey) -> SyncResult<()> {
        Ok(())
    }

    fn save_remote_document(&self, _doc: &MutableDocument) -> SyncResult<()> {
        Ok(())
    }

    fn remove_remote_document(&self, _key: &DocumentKey) -> SyncResult<()> {
        Ok(())
    }

    fn save_target_state(&self, _state: &TargetState) -> SyncResult<()> {
        Ok(())
    }

    fn remove_target_state(&self, _target_id: i32) -> SyncResult<()> {
        Ok(())
    }

    /// Restores the durable state for `user`, invoked once at startup and on
    /// every user change.
    fn load(&self, _user: &User) -> SyncResult<PersistedState> {
        Ok(PersistedState::default())
    }
}

/// Snapshot of durable state handed back by [`LocalPersistence::load`].
#[derive(Default)]
pub struct PersistedState {
    pub batches: Vec<MutationBatch>,
    pub overlays: Vec<Overlay>,
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    pub targets: Vec<TargetState>,
}

/// No-op persistence; everything lives in memory only.
#[derive(Default)]
pub struct MemoryPersistence;

impl LocalPersistence for MemoryPersistence {}
