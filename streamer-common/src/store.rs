use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::entry::{ConsumerId, Entry, EntryId, Payload};

// Re-exported so callers can build errors of a given kind in tests.
pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Unexpected reply from the store: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Redis(Arc::new(err))
        }
    }
}

impl From<std::string::FromUtf8Error> for StoreError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        StoreError::ParseError(err.to_string())
    }
}

impl StoreError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        StoreError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Whether the connection to the store itself failed, as opposed to a command being rejected.
    pub fn is_connection_error(&self) -> bool {
        match self {
            StoreError::Timeout => true,
            StoreError::Redis(err) => {
                err.kind() == redis::ErrorKind::IoError
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
            }
            StoreError::InvalidConfiguration(_) | StoreError::ParseError(_) => false,
        }
    }
}

/// Outcome of creating a consumer group. Both variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// The operations on an append-only log that consumer groups need.
///
/// Implementations must be safe to share between tasks: acknowledgements are issued
/// concurrently from every worker while a single reader is blocked in `read_group`.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create `group` on `stream`, creating the stream too if it does not exist yet.
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, StoreError>;

    /// Claim up to `count` new entries for `consumer`.
    ///
    /// `block` of `None` waits until entries arrive. An empty result means the block
    /// elapsed without anything new.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &ConsumerId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>, StoreError>;

    /// Returns the number of entries that were acknowledged (0 if it was not pending).
    async fn ack(&self, stream: &str, group: &str, id: &EntryId) -> Result<u64, StoreError>;

    /// Remove `consumer` from `group`. Returns how many pending entries it still owned.
    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &ConsumerId,
    ) -> Result<u64, StoreError>;

    /// Append `payload`, trimming the stream to roughly `max_len` entries when given.
    async fn append(
        &self,
        stream: &str,
        payload: &Payload,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError>;
}
