use super::AccessorShared;
use crate::core::{Document, Result, Selector};
use crate::storage::{ConnectionManager, StoreConnection};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Replace,
    Delete,
}

/// A fully prepared mutation. Payloads are frozen at preparation time.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    Insert { document: Document },
    Replace { selector: Selector, document: Document },
    Delete { selector: Selector },
}

impl WriteCommand {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteCommand::Insert { .. } => WriteKind::Insert,
            WriteCommand::Replace { .. } => WriteKind::Replace,
            WriteCommand::Delete { .. } => WriteKind::Delete,
        }
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            WriteCommand::Insert { document } | WriteCommand::Replace { document, .. } => {
                Some(document)
            }
            WriteCommand::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub kind: WriteKind,
    /// Documents inserted, replaced or deleted.
    pub affected: u64,
}

/// A deferred write: validated and encoded, not yet executed.
///
/// Each [`execute`](Self::execute) acquires its own connection and performs
/// the I/O again; the command itself is never re-encoded.
pub struct DeferredWrite<M: ConnectionManager> {
    collection: String,
    record_id: Uuid,
    command: WriteCommand,
    target: Arc<AccessorShared<M>>,
}

impl<M: ConnectionManager> DeferredWrite<M> {
    pub(crate) fn new(
        target: Arc<AccessorShared<M>>,
        collection: &str,
        record_id: Uuid,
        command: WriteCommand,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            record_id,
            command,
            target,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn kind(&self) -> WriteKind {
        self.command.kind()
    }

    pub fn command(&self) -> &WriteCommand {
        &self.command
    }

    pub async fn execute(&self) -> Result<WriteOutcome> {
        let span = info_span!(
            "docbridge.write",
            collection = %self.collection,
            id = %self.record_id,
            kind = ?self.kind()
        );
        self.run().instrument(span).await
    }

    async fn run(&self) -> Result<WriteOutcome> {
        let target = &self.target;
        target
            .registry
            .resource_for(&target.pool, &self.collection)
            .await?;

        let mut conn = target.pool.acquire().await?;
        let result = match &self.command {
            WriteCommand::Insert { document } => conn
                .insert(&self.collection, document.clone())
                .await
                .map(|()| 1),
            WriteCommand::Replace { selector, document } => conn
                .replace(&self.collection, selector, document.clone())
                .await,
            WriteCommand::Delete { selector } => conn.delete(&self.collection, selector).await,
        };

        match conn.finish(result) {
            Ok(affected) => {
                event!(Level::DEBUG, affected, "write executed");
                Ok(WriteOutcome {
                    kind: self.kind(),
                    affected,
                })
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    severity = err.severity().as_str(),
                    error = %err,
                    "write failed"
                );
                Err(err)
            }
        }
    }
}

impl<M: ConnectionManager> Clone for DeferredWrite<M> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            record_id: self.record_id,
            command: self.command.clone(),
            target: Arc::clone(&self.target),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for DeferredWrite<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredWrite")
            .field("collection", &self.collection)
            .field("record_id", &self.record_id)
            .field("command", &self.command)
            .finish()
    }
}

/// Runs all actions concurrently; results keep the order of `actions`.
pub async fn execute_all<M: ConnectionManager>(
    actions: &[DeferredWrite<M>],
) -> Vec<Result<WriteOutcome>> {
    join_all(actions.iter().map(|action| action.execute())).await
}
