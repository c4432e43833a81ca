//! Store identity bootstrap.
//!
//! Every store carries exactly one identity record in [`METADATA_COLLECTION`].
//! Concurrent first users may all attempt to create it; instead of preventing
//! that race, the bootstrap tries to create the collection and, when it already
//! exists, re-reads and classifies the number of identity records.

use super::mapper::{self, DecodeContext, Record};
use crate::core::{AccessorError, Result};
use crate::storage::StoreConnection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{Level, event};
use uuid::Uuid;

pub const METADATA_COLLECTION: &str = "danakeMetadata";

/// The durable identity record of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreIdentity {
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl StoreIdentity {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.id.hyphenated().to_string())
    }
}

impl Record for StoreIdentity {
    fn record_id(&self) -> Uuid {
        self.id
    }
}

/// Stable token identifying one store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an existing metadata collection tells us, by identity record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Exactly one record: adopt it.
    Adopt,
    /// The collection exists but holds no record.
    Missing,
    /// Several records: concurrent bootstraps or tampering.
    Ambiguous(usize),
}

impl Reconciliation {
    pub fn classify(count: u64) -> Self {
        match count {
            0 => Self::Missing,
            1 => Self::Adopt,
            n => Self::Ambiguous(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }
}

/// Establishes or reads the store identity and returns its fingerprint.
pub async fn bootstrap<C: StoreConnection + ?Sized>(conn: &mut C) -> Result<Fingerprint> {
    match conn.create_collection(METADATA_COLLECTION).await {
        Ok(()) => {
            let identity = StoreIdentity::generate();
            conn.insert(METADATA_COLLECTION, mapper::encode(&identity)?)
                .await?;
            event!(Level::INFO, fingerprint = %identity.id, "created store identity");
            Ok(identity.fingerprint())
        }
        Err(AccessorError::CollectionExists(_)) => reconcile(conn).await,
        Err(err) => Err(err),
    }
}

async fn reconcile<C: StoreConnection + ?Sized>(conn: &mut C) -> Result<Fingerprint> {
    let count = conn.count(METADATA_COLLECTION).await?;

    match Reconciliation::classify(count) {
        Reconciliation::Adopt => {
            let Some(document) = conn.find_one(METADATA_COLLECTION, None).await? else {
                return Err(retrieval_failed());
            };
            let context = DecodeContext::new(METADATA_COLLECTION);
            let identity: StoreIdentity = match mapper::decode(document, &context) {
                Ok(identity) => identity,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        severity = "critical",
                        collection = METADATA_COLLECTION,
                        error = %err,
                        "store identity record is undecodable"
                    );
                    return Err(err);
                }
            };
            event!(Level::DEBUG, fingerprint = %identity.id, "adopted store identity");
            Ok(identity.fingerprint())
        }
        Reconciliation::Missing => Err(retrieval_failed()),
        Reconciliation::Ambiguous(count) => {
            event!(
                Level::ERROR,
                severity = "critical",
                collection = METADATA_COLLECTION,
                count,
                "multiple store identity records"
            );
            Err(AccessorError::MetadataCount(count))
        }
    }
}

fn retrieval_failed() -> AccessorError {
    event!(
        Level::ERROR,
        severity = "critical",
        collection = METADATA_COLLECTION,
        "store identity record could not be retrieved"
    );
    AccessorError::MetadataRetrieval
}
