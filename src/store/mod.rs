//! # Stores
//!
//! Storage abstractions consumed by the core:
//!
//! - `DocumentStore`: metadata records + config documents, optional transactions
//! - `BlobStore`: opaque binary content in two namespaces
//!
//! `RetryingDocuments` / `RetryingBlobs` route every call through a
//! `RetryPolicy`. Store handles are explicit values owned by the caller;
//! nothing in the core opens or closes a store.

pub mod blob;
pub mod document;
pub mod errors;
pub mod local;
pub mod memory;

pub use blob::{BlobId, BlobMetadata, BlobNamespace, BlobStore, RetryingBlobs, StoredBlob};
pub use document::{DocumentStore, RecordFilter, RetryingDocuments, TransactionScope, TxnHandle};
pub use errors::{StoreError, StoreResult};
pub use local::{LocalBlobStore, LocalDocumentStore};
pub use memory::{MemoryBlobStore, MemoryDocumentStore};
