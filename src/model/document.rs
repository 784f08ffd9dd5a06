use crate::model::{DocumentKey, FieldPath, Timestamp};
use crate::value::{FieldValue, MapValue};

/// Lifecycle of a cached document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    /// Nothing is known about the document; placeholder produced by cache
    /// misses.
    Invalid,
    /// The document exists and carries data.
    Found,
    /// The server confirmed the document does not exist.
    NoDocument,
    /// The document is known to exist but its contents are not cached
    /// (e.g. a patch was acknowledged against an unseen document).
    Unknown,
}

/// Orthogonal local-write state layered over the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as the caches track it: lifecycle tag, version, data, and the
/// local-mutation axis. Instances are owned by exactly one cache at a time
/// and handed out by value.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    doc_type: DocumentType,
    version: Timestamp,
    read_time: Timestamp,
    data: MapValue,
    sync_state: SyncState,
}

impl MutableDocument {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            doc_type: DocumentType::Invalid,
            version: Timestamp::ZERO,
            read_time: Timestamp::ZERO,
            data: MapValue::empty(),
            sync_state: SyncState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: Timestamp, data: MapValue) -> Self {
        Self {
            key,
            doc_type: DocumentType::Found,
            version,
            read_time: Timestamp::ZERO,
            data,
            sync_state: SyncState::Synced,
        }
    }

    pub fn new_no_document(key: DocumentKey, version: Timestamp) -> Self {
        Self {
            key,
            doc_type: DocumentType::NoDocument,
            version,
            read_time: Timestamp::ZERO,
            data: MapValue::empty(),
            sync_state: SyncState::Synced,
        }
    }

    pub fn new_unknown(key: DocumentKey, version: Timestamp) -> Self {
        Self {
            key,
            doc_type: DocumentType::Unknown,
            version,
            read_time: Timestamp::ZERO,
            data: MapValue::empty(),
            sync_state: SyncState::HasCommittedMutations,
        }
    }

    pub fn convert_to_found(&mut self, version: Timestamp, data: MapValue) -> &mut Self {
        self.doc_type = DocumentType::Found;
        self.version = version;
        self.data = data;
        self.sync_state = SyncState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: Timestamp) -> &mut Self {
        self.doc_type = DocumentType::NoDocument;
        self.version = version;
        self.data = MapValue::empty();
        self.sync_state = SyncState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: Timestamp) -> &mut Self {
        self.doc_type = DocumentType::Unknown;
        self.version = version;
        self.data = MapValue::empty();
        self.sync_state = SyncState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.sync_state = SyncState::HasLocalMutations;
        self.version = Timestamp::ZERO;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.sync_state = SyncState::HasCommittedMutations;
        self
    }

    pub fn set_synced(&mut self) -> &mut Self {
        self.sync_state = SyncState::Synced;
        self
    }

    pub fn set_read_time(&mut self, read_time: Timestamp) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> Timestamp {
        self.version
    }

    pub fn read_time(&self) -> Timestamp {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        self.data.field(path)
    }

    pub fn doc_type(&self) -> DocumentType {
        self.doc_type
    }

    pub fn is_found_document(&self) -> bool {
        self.doc_type == DocumentType::Found
    }

    pub fn is_no_document(&self) -> bool {
        self.doc_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.doc_type == DocumentType::Unknown
    }

    /// Whether anything at all is known about this document.
    pub fn is_valid_document(&self) -> bool {
        self.doc_type != DocumentType::Invalid
    }

    pub fn has_local_mutations(&self) -> bool {
        self.sync_state == SyncState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.sync_state == SyncState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}
