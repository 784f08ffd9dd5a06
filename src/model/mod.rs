mod database_id;
mod document;
mod document_key;
mod field_path;
mod mutation;
mod overlay;
mod resource_path;
mod timestamp;

pub use database_id::DatabaseId;
pub use document::{DocumentType, MutableDocument, SyncState};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationBatch,
    MutationBatchResult, MutationResult, Precondition, TransformOperation,
};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use timestamp::Timestamp;
