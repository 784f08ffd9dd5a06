//! Offline-capable document synchronization core for the Gridbase client.
//!
//! The crate keeps a local, persistent document cache that stays readable
//! and writable while disconnected: local writes are queued as durable
//! mutation batches and raised over the server-confirmed state as overlays,
//! a watch stream keeps live query views incrementally updated, and a write
//! stream drains the queue in order once connectivity returns.
//!
//! The main entry point is [`sync::SyncClient`]; embedders supply a
//! [`remote::Connection`] (the wire transport), a
//! [`credentials::CredentialsProvider`], and a
//! [`local::LocalPersistence`] backend.

pub mod credentials;
pub mod error;
pub mod local;
pub mod model;
pub mod query;
pub mod remote;
pub mod sync;
pub mod util;
pub mod value;

pub use credentials::{AnonymousCredentials, CredentialsProvider, User};
pub use error::{SyncError, SyncErrorCode, SyncResult};
pub use model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, Precondition,
    ResourcePath, Timestamp,
};
pub use query::{Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
pub use sync::{ClientConfig, ListenOptions, SnapshotListener, SyncClient, ViewSnapshot};
pub use value::{FieldValue, MapValue};
