use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::model::{DocumentKey, MutationBatch, MutationBatchResult};
use crate::remote::remote_event::RemoteEvent;

/// The seam through which the remote store hands results back to the sync
/// machinery (and pulls pending work out of it).
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one coherent remote event to local state and listeners.
    async fn apply_remote_event(&self, event: RemoteEvent) -> SyncResult<()>;

    /// The server permanently rejected a listen target.
    async fn reject_listen(&self, target_id: i32, error: SyncError) -> SyncResult<()>;

    /// The server acknowledged a mutation batch.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()>;

    /// The server permanently rejected a mutation batch.
    async fn reject_failed_write(&self, batch_id: i32, error: SyncError) -> SyncResult<()>;

    /// Documents the given target was last known to contain; seeds the
    /// watch-change aggregator after (re)connects.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// The next unacknowledged batch after `after_batch_id`, in queue order.
    async fn next_mutation_batch(
        &self,
        after_batch_id: Option<i32>,
    ) -> SyncResult<Option<MutationBatch>>;
}
