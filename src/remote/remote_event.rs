use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MutableDocument, Timestamp};

/// One coherent batch of target-scoped changes, produced by reconciling raw
/// watch messages against locally tracked target state.
#[derive(Clone, Debug, Default)]
pub struct RemoteEvent {
    /// Consistent snapshot version the event was read at.
    pub snapshot_version: Option<Timestamp>,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets that must be resynced from scratch (existence-filter
    /// mismatch or server-requested reset).
    pub target_resets: BTreeSet<i32>,
    /// Authoritative document states carried by this event. Tombstones are
    /// `no-document` entries; synthesized deletes use version zero.
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_resets.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta within a remote event.
#[derive(Clone, Debug, Default)]
pub struct TargetChange {
    pub resume_token: Option<Vec<u8>>,
    /// Whether the server declared the target caught up with this event.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}
