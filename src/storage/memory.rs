use super::{ConnectionManager, StoreConnection};
use crate::connection::config::ConnectionConfig;
use crate::core::{AccessorError, Document, Result, Selector, document_id, id_string};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

type Collection = BTreeMap<String, Document>;
type Database = BTreeMap<String, Collection>;

/// Store operations that can carry an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListCollections,
    CreateCollection,
    Count,
    FindOne,
    Find,
    Insert,
    Replace,
    Delete,
}

/// A one-shot failure returned by the next matching operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Transport failure; the connection is unusable afterwards.
    Network,
    /// Malformed reply; the connection is unusable afterwards.
    Protocol,
    /// Another creator won the race: the collection is created, then
    /// `CollectionExists` is reported.
    CollectionExists,
    /// Server-side rejection that leaves the connection intact.
    Rejected(String),
    /// The read succeeds but returns no documents, as after a concurrent
    /// delete between two round trips.
    EmptyReply,
}

/// How a round trip without a transport failure should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Normal,
    Empty,
}

/// Storage key for an identity field value.
///
/// UUIDs are keyed by their canonical form, whatever case they were written in.
fn storage_key(id: &str) -> String {
    Uuid::parse_str(id).map_or_else(|_| id.to_string(), id_string)
}

fn identity_key(document: &Document) -> Result<String> {
    document_id(document)
        .map(storage_key)
        .ok_or_else(|| AccessorError::Store("document has no identity field".into()))
}

/// In-process document server.
///
/// Holds any number of named databases. Connections are opened through a
/// [`MemoryConnectionManager`]. Every lock is held for in-memory work only.
pub struct MemoryStore {
    databases: RwLock<HashMap<String, Database>>,
    faults: Mutex<Vec<(StoreOp, Fault)>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    connections_opened: AtomicUsize,
    create_collection_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            databases: RwLock::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            latency: Mutex::new(None),
            connections_opened: AtomicUsize::new(0),
            create_collection_calls: AtomicUsize::new(0),
        })
    }

    /// While offline, every connect attempt fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay applied to every round trip.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    /// Queues a fault for the next `op` on any connection.
    pub fn inject_fault(&self, op: StoreOp, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((op, fault));
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
    }

    pub fn create_collection_calls(&self) -> usize {
        self.create_collection_calls.load(Ordering::SeqCst)
    }

    /// Inserts a document without faults, latency or duplicate checks on
    /// the collection's existence.
    pub fn raw_insert(&self, database: &str, collection: &str, document: Document) -> Result<()> {
        let id = identity_key(&document)?;
        let mut databases = self.write()?;
        let collection = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        collection.insert(id, document);
        Ok(())
    }

    pub fn raw_count(&self, database: &str, collection: &str) -> usize {
        self.read()
            .ok()
            .and_then(|databases| {
                databases
                    .get(database)
                    .and_then(|db| db.get(collection))
                    .map(BTreeMap::len)
            })
            .unwrap_or(0)
    }

    pub fn raw_find(&self, database: &str, collection: &str, id: &str) -> Option<Document> {
        self.read().ok().and_then(|databases| {
            databases
                .get(database)
                .and_then(|db| db.get(collection))
                .and_then(|c| c.get(&storage_key(id)))
                .cloned()
        })
    }

    pub fn collection_names(&self, database: &str) -> Vec<String> {
        self.read()
            .ok()
            .and_then(|databases| databases.get(database).map(|db| db.keys().cloned().collect()))
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Database>>> {
        Ok(self.databases.read()?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Database>>> {
        Ok(self.databases.write()?)
    }

    fn take_fault(&self, op: StoreOp) -> Option<Fault> {
        let mut faults = self.faults.lock().ok()?;
        let position = faults.iter().position(|(candidate, _)| *candidate == op)?;
        Some(faults.remove(position).1)
    }

    fn current_latency(&self) -> Option<Duration> {
        self.latency.lock().ok().and_then(|latency| *latency)
    }
}

/// Opens [`MemoryConnection`]s to one database of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryConnectionManager {
    store: Arc<MemoryStore>,
    config: ConnectionConfig,
}

impl MemoryConnectionManager {
    pub fn new(store: Arc<MemoryStore>, config: ConnectionConfig) -> Self {
        Self { store, config }
    }

    /// Targets the database named in a `docbridge://` connection string.
    pub fn from_url(store: Arc<MemoryStore>, url: &str) -> Result<Self> {
        let config = ConnectionConfig::from_url(url).map_err(AccessorError::Config)?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl ConnectionManager for MemoryConnectionManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        if self.store.offline.load(Ordering::SeqCst) {
            return Err(AccessorError::Connection(format!(
                "cannot reach {}:{}",
                self.config.host, self.config.port
            )));
        }
        self.store.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            store: Arc::clone(&self.store),
            database: self.config.database.clone(),
            broken: false,
        })
    }

    fn database(&self) -> &str {
        &self.config.database
    }
}

pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    database: String,
    broken: bool,
}

impl MemoryConnection {
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Simulates the round trip: latency, broken-connection check and any
    /// injected fault for `op`.
    async fn round_trip(&mut self, op: StoreOp, collection: &str) -> Result<Reply> {
        if let Some(latency) = self.store.current_latency() {
            tokio::time::sleep(latency).await;
        }
        if self.broken {
            return Err(AccessorError::Connection("connection is broken".into()));
        }
        match self.store.take_fault(op) {
            None => Ok(Reply::Normal),
            Some(Fault::Network) => {
                self.broken = true;
                Err(AccessorError::Connection(format!(
                    "{:?} on '{}': connection reset",
                    op, collection
                )))
            }
            Some(Fault::Protocol) => {
                self.broken = true;
                Err(AccessorError::Protocol(format!(
                    "{:?} on '{}': malformed reply",
                    op, collection
                )))
            }
            Some(Fault::CollectionExists) => {
                let mut databases = self.store.write()?;
                databases
                    .entry(self.database.clone())
                    .or_default()
                    .entry(collection.to_string())
                    .or_default();
                Err(AccessorError::CollectionExists(collection.to_string()))
            }
            Some(Fault::Rejected(reason)) => Err(AccessorError::Store(reason)),
            Some(Fault::EmptyReply) => Ok(Reply::Empty),
        }
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn list_collections(&mut self) -> Result<Vec<String>> {
        self.round_trip(StoreOp::ListCollections, "").await?;
        let databases = self.store.read()?;
        Ok(databases
            .get(&self.database)
            .map(|db| db.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_collection(&mut self, collection: &str) -> Result<()> {
        self.store.create_collection_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip(StoreOp::CreateCollection, collection).await?;
        let mut databases = self.store.write()?;
        let database = databases.entry(self.database.clone()).or_default();
        if database.contains_key(collection) {
            return Err(AccessorError::CollectionExists(collection.to_string()));
        }
        database.insert(collection.to_string(), Collection::new());
        Ok(())
    }

    async fn count(&mut self, collection: &str) -> Result<u64> {
        self.round_trip(StoreOp::Count, collection).await?;
        Ok(self.store.raw_count(&self.database, collection) as u64)
    }

    async fn find_one(
        &mut self,
        collection: &str,
        selector: Option<&Selector>,
    ) -> Result<Option<Document>> {
        if self.round_trip(StoreOp::FindOne, collection).await? == Reply::Empty {
            return Ok(None);
        }
        let databases = self.store.read()?;
        let Some(documents) = databases
            .get(&self.database)
            .and_then(|db| db.get(collection))
        else {
            return Ok(None);
        };
        Ok(match selector {
            Some(selector) => documents.get(&id_string(selector.id())).cloned(),
            None => documents.values().next().cloned(),
        })
    }

    async fn find(&mut self, collection: &str) -> Result<Vec<Document>> {
        if self.round_trip(StoreOp::Find, collection).await? == Reply::Empty {
            return Ok(Vec::new());
        }
        let databases = self.store.read()?;
        Ok(databases
            .get(&self.database)
            .and_then(|db| db.get(collection))
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&mut self, collection: &str, document: Document) -> Result<()> {
        self.round_trip(StoreOp::Insert, collection).await?;
        let id = identity_key(&document)?;
        let mut databases = self.store.write()?;
        // Inserting into a missing collection creates it implicitly.
        let documents = databases
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        if documents.contains_key(&id) {
            return Err(AccessorError::DuplicateKey {
                collection: collection.to_string(),
                id,
            });
        }
        documents.insert(id, document);
        Ok(())
    }

    async fn replace(
        &mut self,
        collection: &str,
        selector: &Selector,
        document: Document,
    ) -> Result<u64> {
        self.round_trip(StoreOp::Replace, collection).await?;
        let mut databases = self.store.write()?;
        let Some(existing) = databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(collection))
            .and_then(|documents| documents.get_mut(&id_string(selector.id())))
        else {
            return Ok(0);
        };
        *existing = document;
        Ok(1)
    }

    async fn delete(&mut self, collection: &str, selector: &Selector) -> Result<u64> {
        self.round_trip(StoreOp::Delete, collection).await?;
        let mut databases = self.store.write()?;
        let removed = databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(collection))
            .and_then(|documents| documents.remove(&id_string(selector.id())));
        Ok(u64::from(removed.is_some()))
    }
}
