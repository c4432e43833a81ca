use crate::connection::ConnectionPool;
use crate::core::{AccessorError, Result};
use crate::storage::{ConnectionManager, StoreConnection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{Level, event};

/// Handle to a collection known to exist in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionHandle {
    name: String,
}

impl CollectionHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Memoized record of which collections exist.
///
/// `startup` is the snapshot taken at construction and never changes.
/// Collections first seen later get a per-name cell in `created`; the map
/// lock only guards the lookup, while the cell serializes creation of that
/// one name. Creation of different names proceeds in parallel.
pub struct CollectionRegistry {
    startup: HashSet<String>,
    created: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl CollectionRegistry {
    pub fn from_snapshot(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            startup: names.into_iter().collect(),
            created: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the collections currently present in the store.
    pub async fn load<C: StoreConnection + ?Sized>(conn: &mut C) -> Result<Self> {
        let names = conn.list_collections().await?;
        event!(Level::DEBUG, collections = names.len(), "loaded collection snapshot");
        Ok(Self::from_snapshot(names))
    }

    pub fn is_known(&self, name: &str) -> bool {
        if self.startup.contains(name) {
            return true;
        }
        self.created
            .lock()
            .map(|created| created.get(name).is_some_and(|cell| cell.initialized()))
            .unwrap_or(false)
    }

    /// All collections known to exist, sorted.
    pub fn known(&self) -> Vec<String> {
        let mut names: Vec<String> = self.startup.iter().cloned().collect();
        if let Ok(created) = self.created.lock() {
            names.extend(
                created
                    .iter()
                    .filter(|(_, cell)| cell.initialized())
                    .map(|(name, _)| name.clone()),
            );
        }
        names.sort();
        names
    }

    /// Returns a handle for `name`, creating the collection on first use.
    pub async fn resource_for<M: ConnectionManager>(
        &self,
        pool: &ConnectionPool<M>,
        name: &str,
    ) -> Result<CollectionHandle> {
        if self.startup.contains(name) {
            return Ok(CollectionHandle::new(name));
        }

        let cell = {
            let mut created = self.created.lock()?;
            Arc::clone(created.entry(name.to_string()).or_default())
        };

        cell.get_or_try_init(|| create_collection(pool, name))
            .await?;

        Ok(CollectionHandle::new(name))
    }
}

async fn create_collection<M: ConnectionManager>(
    pool: &ConnectionPool<M>,
    name: &str,
) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let result = conn.create_collection(name).await;

    match conn.finish(result) {
        Ok(()) => {
            event!(Level::DEBUG, collection = %name, "created collection");
            Ok(())
        }
        Err(AccessorError::CollectionExists(_)) => {
            event!(Level::DEBUG, collection = %name, "collection created concurrently");
            Ok(())
        }
        Err(err) => {
            event!(
                Level::ERROR,
                severity = "critical",
                collection = %name,
                error = %err,
                "collection creation failed"
            );
            if err.breaks_connection() {
                Err(err)
            } else {
                Err(AccessorError::CollectionCreation {
                    collection: name.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}
