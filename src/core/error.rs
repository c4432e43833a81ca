use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error(
        "Connection pool timeout after {waited:?}: all {max_connections} connections checked out"
    )]
    PoolTimeout {
        waited: Duration,
        max_connections: usize,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Collection '{0}' already exists")]
    CollectionExists(String),

    #[error("Failed to create collection '{collection}': {reason}")]
    CollectionCreation { collection: String, reason: String },

    #[error("metadataCount({0})")]
    MetadataCount(usize),

    #[error("metadataRetrievalError")]
    MetadataRetrieval,

    #[error("{0}")]
    InvalidName(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error in '{collection}' for id {id}: {reason}")]
    Decode {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("Duplicate key '{id}' in collection '{collection}'")]
    DuplicateKey { collection: String, id: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How loudly a failure should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Rejected input or data; the caller can fix it.
    Business,
    /// A single operation failed against the store.
    Operational,
    /// Unexpected store behaviour or inconsistent persistent state.
    Critical,
    /// Systemic overload.
    Emergency,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Business => "business",
            Severity::Operational => "operational",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }
}

impl AccessorError {
    /// True when the failure may have left the connection unusable, so the
    /// pool must discard it instead of caching it again.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Protocol(_))
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::PoolTimeout { .. } | Self::PoolClosed => Severity::Emergency,
            Self::CollectionCreation { .. } | Self::MetadataCount(_) | Self::MetadataRetrieval => {
                Severity::Critical
            }
            Self::Connection(_) | Self::Protocol(_) | Self::Store(_) => Severity::Operational,
            Self::CollectionExists(_)
            | Self::InvalidName(_)
            | Self::Encode(_)
            | Self::Decode { .. }
            | Self::DuplicateKey { .. }
            | Self::Config(_) => Severity::Business,
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessorError>;

impl<T> From<std::sync::PoisonError<T>> for AccessorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Store(format!("lock poisoned: {}", err))
    }
}

impl From<serde_json::Error> for AccessorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
