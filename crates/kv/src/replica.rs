//! The storage replica contract consumed by a [`Farm`](crate::farm::Farm).
//!
//! A replica is one full copy of the data set. It may shard keys
//! internally; the farm never sees that. Per-key writes stream back one
//! [`Outcome`] per key so a slow key does not hold up the rest.

use farm_common::{Entry, KeyField, Limits, Presence};
use farm_storage::StorageError;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Entries grouped by key, as produced by [`farm_common::bucket_by_key`].
pub type Buckets = BTreeMap<String, Vec<Entry>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica failed: {0}")]
    Failed(String),
    #[error("replica closed")]
    Closed,
    #[error("timeout")]
    Timeout,
    #[error("key {key:?} would hold {size} fields, max {max}")]
    MaxSize { key: String, size: u64, max: u64 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ReplicaError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::MaxSize { key, size, max } => Self::MaxSize { key, size, max },
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result of a write for one key at one replica: how many fields changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub key: String,
    pub result: Result<u64, ReplicaError>,
}

impl Outcome {
    pub fn ok(key: impl Into<String>, count: u64) -> Self {
        Self {
            key: key.into(),
            result: Ok(count),
        }
    }

    pub fn err(key: impl Into<String>, error: ReplicaError) -> Self {
        Self {
            key: key.into(),
            result: Err(error),
        }
    }
}

pub type OutcomeStream = BoxStream<'static, Outcome>;
pub type NameStream = BoxStream<'static, Result<String, ReplicaError>>;

/// One independently reachable copy of the data set.
#[async_trait::async_trait]
pub trait Replica: Send + Sync + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Insert every bucket. Per `(key, field)` the write lands only if its
    /// score beats what the replica holds, and it atomically replaces any
    /// tombstone. The key's cardinality ceiling is enforced atomically.
    fn insert(&self, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream;

    /// Write tombstones for every bucket (inverse of `insert`).
    fn delete(&self, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream;

    /// Physically stored state of each pair, expired records included.
    async fn score(&self, pairs: &[KeyField]) -> Result<HashMap<KeyField, Presence>, ReplicaError>;

    /// Live entries for the requested fields of one key.
    async fn select(&self, key: &str, fields: &[String]) -> Result<Vec<Entry>, ReplicaError>;

    /// Live entries of one key, highest score first.
    async fn select_range(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entry>, ReplicaError>;

    /// Every key with at least one inserted field, expired-but-unreaped included.
    fn keys(&self) -> NameStream;

    /// Every inserted field of `key`, expired-but-unreaped included.
    fn members(&self, key: &str) -> NameStream;

    /// Live cardinality of `key`.
    async fn size(&self, key: &str) -> Result<u64, ReplicaError>;

    /// Physically remove every expired record, tombstones included.
    /// Returns how many records went.
    async fn purge(&self) -> Result<u64, ReplicaError>;

    /// Release resources. Idempotent; later calls fail with `Closed`.
    async fn close(&self) -> Result<(), ReplicaError>;
}
