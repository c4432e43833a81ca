//! Document store accessor
//!
//! [`DocumentAccessor`] is the surface offered to a persistence framework:
//! synchronous-looking reads (`fetch_by_id`, `scan_all`) and deferred writes
//! (`prepare_*` returning a [`DeferredWrite`]). Every network round trip goes
//! through the connection pool and is released on every exit path.

pub mod action;
pub mod identity;
pub mod mapper;
pub mod naming;
pub mod registry;

use crate::connection::{ConnectionConfig, ConnectionPool, PoolStatus};
use crate::core::{AccessorError, Result, Selector};
use crate::storage::{ConnectionManager, StoreConnection};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub use action::{DeferredWrite, WriteCommand, WriteKind, WriteOutcome, execute_all};
pub use identity::{Fingerprint, METADATA_COLLECTION, Reconciliation, StoreIdentity};
pub use mapper::{DecodeContext, Entity, Record};
pub use naming::validate_collection_name;
pub use registry::{CollectionHandle, CollectionRegistry};

/// State shared by an accessor and the writes it prepares.
pub(crate) struct AccessorShared<M: ConnectionManager> {
    pub(crate) pool: ConnectionPool<M>,
    pub(crate) registry: CollectionRegistry,
    fingerprint: Fingerprint,
}

/// Connection-pooled accessor for one database of a document store.
///
/// Cloning is cheap; clones share the pool and the collection registry.
pub struct DocumentAccessor<M: ConnectionManager> {
    shared: Arc<AccessorShared<M>>,
}

impl<M: ConnectionManager> Clone for DocumentAccessor<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> DocumentAccessor<M> {
    /// Open the pool, establish the store identity and snapshot collections.
    ///
    /// Fails when the store is unreachable or its identity is ambiguous.
    pub async fn open(manager: M, config: ConnectionConfig) -> Result<Self> {
        let database = manager.database().to_string();
        let pool = ConnectionPool::new(manager, config).await?;

        let mut conn = pool.acquire().await?;
        let result = async {
            let fingerprint = identity::bootstrap(&mut *conn).await?;
            let registry = CollectionRegistry::load(&mut *conn).await?;
            Ok::<_, AccessorError>((fingerprint, registry))
        }
        .await;
        let (fingerprint, registry) = match conn.finish(result) {
            Ok(opened) => opened,
            Err(err) => {
                event!(
                    Level::ERROR,
                    severity = err.severity().as_str(),
                    database = %database,
                    error = %err,
                    "failed to open accessor"
                );
                return Err(err);
            }
        };

        event!(
            Level::INFO,
            database = %database,
            fingerprint = %fingerprint,
            collections = registry.known().len(),
            "accessor opened"
        );

        Ok(Self {
            shared: Arc::new(AccessorShared {
                pool,
                registry,
                fingerprint,
            }),
        })
    }

    /// Stable token identifying the backing store.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.shared.fingerprint
    }

    pub fn validate_collection_name(&self, name: &str) -> Result<()> {
        validate_collection_name(name)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.shared.pool.status()
    }

    /// Collections known to exist, sorted.
    pub fn known_collections(&self) -> Vec<String> {
        self.shared.registry.known()
    }

    /// Returns a handle for `collection`, creating it on first use.
    pub async fn resource_for(&self, collection: &str) -> Result<CollectionHandle> {
        validate_collection_name(collection)?;
        self.shared
            .registry
            .resource_for(&self.shared.pool, collection)
            .await
    }

    pub async fn fetch_by_id<R: Record>(&self, collection: &str, id: Uuid) -> Result<Option<R>> {
        self.fetch_by_id_with(&DecodeContext::new(collection), id)
            .await
    }

    /// Like [`fetch_by_id`](Self::fetch_by_id) with caller supplied decode context.
    pub async fn fetch_by_id_with<R: Record>(
        &self,
        context: &DecodeContext,
        id: Uuid,
    ) -> Result<Option<R>> {
        let span = info_span!("docbridge.fetch", collection = %context.collection(), id = %id);
        async {
            let handle = self.resource_for(context.collection()).await?;
            let selector = Selector::by_id(id);

            let mut conn = self.shared.pool.acquire().await?;
            let result = conn.find_one(handle.name(), Some(&selector)).await;
            let Some(document) = conn.finish(result)? else {
                event!(Level::DEBUG, "record not found");
                return Ok(None);
            };

            match mapper::decode(document, context) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    event!(Level::ERROR, error = %err, "failed to decode record");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// All decodable records of `collection`; undecodable ones are logged and skipped.
    pub async fn scan_all<R: Record>(&self, collection: &str) -> Result<Vec<R>> {
        self.scan_all_with(&DecodeContext::new(collection)).await
    }

    pub async fn scan_all_with<R: Record>(&self, context: &DecodeContext) -> Result<Vec<R>> {
        let span = info_span!("docbridge.scan", collection = %context.collection());
        async {
            let handle = self.resource_for(context.collection()).await?;

            let mut conn = self.shared.pool.acquire().await?;
            let result = conn.find(handle.name()).await;
            let documents = conn.finish(result)?;

            let found = documents.len();
            let records = mapper::decode_all(documents, context);
            event!(Level::DEBUG, found, decoded = records.len(), "scan complete");
            Ok(records)
        }
        .instrument(span)
        .await
    }

    /// Encode `record` now; insert it when the returned write is executed.
    pub fn prepare_insert<R: Record>(
        &self,
        collection: &str,
        record: &R,
    ) -> Result<DeferredWrite<M>> {
        validate_collection_name(collection)?;
        let document = mapper::encode(record)?;
        Ok(self.deferred(
            collection,
            record.record_id(),
            WriteCommand::Insert { document },
        ))
    }

    /// Encode `record` now; replace the stored record with the same id when executed.
    pub fn prepare_replace<R: Record>(
        &self,
        collection: &str,
        record: &R,
    ) -> Result<DeferredWrite<M>> {
        validate_collection_name(collection)?;
        let document = mapper::encode(record)?;
        let selector = Selector::by_id(record.record_id());
        Ok(self.deferred(
            collection,
            record.record_id(),
            WriteCommand::Replace { selector, document },
        ))
    }

    pub fn prepare_delete<R: Record>(
        &self,
        collection: &str,
        record: &R,
    ) -> Result<DeferredWrite<M>> {
        self.prepare_delete_by_id(collection, record.record_id())
    }

    pub fn prepare_delete_by_id(&self, collection: &str, id: Uuid) -> Result<DeferredWrite<M>> {
        validate_collection_name(collection)?;
        let selector = Selector::by_id(id);
        Ok(self.deferred(collection, id, WriteCommand::Delete { selector }))
    }

    /// Execute many prepared writes concurrently, results in input order.
    pub async fn execute_all(&self, actions: &[DeferredWrite<M>]) -> Vec<Result<WriteOutcome>> {
        execute_all(actions).await
    }

    fn deferred(&self, collection: &str, id: Uuid, command: WriteCommand) -> DeferredWrite<M> {
        DeferredWrite::new(Arc::clone(&self.shared), collection, id, command)
    }
}
