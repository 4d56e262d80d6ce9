//! [`Replica`] backed by an embedded [`StorageEngine`].

use crate::replica::{Buckets, NameStream, Outcome, OutcomeStream, Replica, ReplicaError};
use farm_common::{now_ms, Entry, KeyField, Limits, Presence};
use farm_storage::StorageEngine;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Insert,
    Delete,
}

/// A replica living in this process.
#[derive(Debug, Clone)]
pub struct LocalReplica {
    name: String,
    engine: Arc<RwLock<StorageEngine>>,
    closed: Arc<AtomicBool>,
}

impl LocalReplica {
    pub fn new(name: impl Into<String>, engine: StorageEngine) -> Self {
        Self::from_shared(name, Arc::new(RwLock::new(engine)))
    }

    /// Wrap an engine that the caller keeps a handle to (tests inspect it).
    pub fn from_shared(name: impl Into<String>, engine: Arc<RwLock<StorageEngine>>) -> Self {
        Self {
            name: name.into(),
            engine,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &Arc<RwLock<StorageEngine>> {
        &self.engine
    }

    fn check_open(&self) -> Result<(), ReplicaError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ReplicaError::Closed)
        } else {
            Ok(())
        }
    }

    fn write(&self, kind: WriteKind, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream {
        let engine = self.engine.clone();
        let closed = self.closed.clone();
        let keys: Vec<String> = buckets.keys().cloned().collect();

        stream::iter(keys)
            .then(move |key| {
                let engine = engine.clone();
                let closed = closed.clone();
                let buckets = buckets.clone();
                let limits = limits.clone();
                async move {
                    if closed.load(Ordering::Acquire) {
                        return Outcome::err(key, ReplicaError::Closed);
                    }
                    let entries = buckets.get(&key).map(Vec::as_slice).unwrap_or_default();
                    let key_limits = limits.for_key(&key);
                    let result = {
                        let mut e = engine.write().await;
                        match kind {
                            WriteKind::Insert => e.insert(&key, entries, key_limits, now_ms()),
                            WriteKind::Delete => e.delete(&key, entries, key_limits, now_ms()),
                        }
                    };
                    Outcome {
                        key,
                        result: result.map_err(ReplicaError::from),
                    }
                }
            })
            .boxed()
    }

    fn names<F>(&self, list: F) -> NameStream
    where
        F: FnOnce(&StorageEngine) -> Result<Vec<String>, farm_storage::StorageError>
            + Send
            + 'static,
    {
        let engine = self.engine.clone();
        let open = self.check_open();
        stream::once(async move {
            open?;
            let e = engine.read().await;
            list(&e).map_err(ReplicaError::from)
        })
        .flat_map(|res| {
            stream::iter(match res {
                Ok(names) => names.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            })
        })
        .boxed()
    }
}

#[async_trait::async_trait]
impl Replica for LocalReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream {
        self.write(WriteKind::Insert, buckets, limits)
    }

    fn delete(&self, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream {
        self.write(WriteKind::Delete, buckets, limits)
    }

    async fn score(&self, pairs: &[KeyField]) -> Result<HashMap<KeyField, Presence>, ReplicaError> {
        self.check_open()?;
        let e = self.engine.read().await;
        let mut out = HashMap::with_capacity(pairs.len());
        for kf in pairs {
            out.insert(kf.clone(), e.presence(&kf.key, &kf.field)?);
        }
        Ok(out)
    }

    async fn select(&self, key: &str, fields: &[String]) -> Result<Vec<Entry>, ReplicaError> {
        self.check_open()?;
        Ok(self.engine.read().await.select(key, fields, now_ms())?)
    }

    async fn select_range(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entry>, ReplicaError> {
        self.check_open()?;
        Ok(self.engine.read().await.range(key, offset, limit, now_ms())?)
    }

    fn keys(&self) -> NameStream {
        self.names(|e| e.keys(None))
    }

    fn members(&self, key: &str) -> NameStream {
        let key = key.to_string();
        self.names(move |e| e.members(&key, None))
    }

    async fn size(&self, key: &str) -> Result<u64, ReplicaError> {
        self.check_open()?;
        Ok(self.engine.read().await.size(key, now_ms())?)
    }

    async fn purge(&self) -> Result<u64, ReplicaError> {
        self.check_open()?;
        let purged = self.engine.write().await.purge_expired(now_ms())?;
        if purged > 0 {
            tracing::debug!("replica {} purged {} expired records", self.name, purged);
        }
        Ok(purged)
    }

    async fn close(&self) -> Result<(), ReplicaError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.write().await.sync()?;
        tracing::debug!("replica {} closed", self.name);
        Ok(())
    }
}
