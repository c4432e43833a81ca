//! Driver boundary: the operations this crate needs from a document store.
//!
//! A [`ConnectionManager`] opens physical connections; a [`StoreConnection`]
//! performs one round trip per call. Implementations report
//! [`AccessorError::Connection`](crate::core::AccessorError::Connection) or
//! [`AccessorError::Protocol`](crate::core::AccessorError::Protocol) for faults
//! that may have broken the connection, so the pool can evict it.

pub mod memory;

use crate::core::{Document, Result, Selector};
use async_trait::async_trait;

pub use memory::{Fault, MemoryConnection, MemoryConnectionManager, MemoryStore, StoreOp};

/// A live connection to one database of a document store.
#[async_trait]
pub trait StoreConnection: Send {
    /// Names of all collections currently present in the database.
    async fn list_collections(&mut self) -> Result<Vec<String>>;

    /// Creates a collection.
    ///
    /// Fails with `CollectionExists` when the collection is already present.
    async fn create_collection(&mut self, collection: &str) -> Result<()>;

    async fn count(&mut self, collection: &str) -> Result<u64>;

    /// First document matching `selector`, or any document when `selector` is `None`.
    async fn find_one(
        &mut self,
        collection: &str,
        selector: Option<&Selector>,
    ) -> Result<Option<Document>>;

    async fn find(&mut self, collection: &str) -> Result<Vec<Document>>;

    /// Fails with `DuplicateKey` when the identity field is already taken.
    async fn insert(&mut self, collection: &str, document: Document) -> Result<()>;

    /// Returns the number of matched documents.
    async fn replace(
        &mut self,
        collection: &str,
        selector: &Selector,
        document: Document,
    ) -> Result<u64>;

    /// Returns the number of deleted documents.
    async fn delete(&mut self, collection: &str, selector: &Selector) -> Result<u64>;
}

/// Opens connections for a pool.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: StoreConnection + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Name of the target database.
    fn database(&self) -> &str;
}
