//! Error taxonomy for the aggregation engine
//!
//! Only two failures stop the process: an empty instrument directory at
//! startup and an expired broker session. Everything else is retried,
//! skipped or swallowed at the point where it occurs.

use thiserror::Error;
use types::ids::InstrumentToken;

/// Failures reported by the tick feed transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("transient feed failure: {0}")]
    Transient(String),

    #[error("broker session expired: {0}")]
    AuthExpired(String),
}

impl FeedError {
    /// Whether the supervisor must stop rather than reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::AuthExpired(_))
    }
}

/// Failures loading the instrument directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("no instruments resolved for exchanges {exchanges:?}")]
    Empty { exchanges: Vec<String> },

    #[error("instrument source unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a historical query for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackfillError {
    #[error("historical query failed for token {token}: {reason}")]
    QueryFailed {
        token: InstrumentToken,
        reason: String,
    },
}

/// Failures writing to or reading from the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window {name} must be positive")]
    ZeroWindow { name: &'static str },

    #[error("no exchanges configured")]
    NoExchanges,
}

/// Fatal engine outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}
