//! Chaos injection wrapper for [`Replica`].
//!
//! [`ChaosReplica`] wraps any `R: Replica` and injects configurable
//! failures: random errors, a hard "down" switch, a budget of one-shot
//! failures, and latency.

use crate::replica::{Buckets, NameStream, Outcome, OutcomeStream, Replica, ReplicaError};
use farm_common::{Entry, KeyField, Limits, Presence};
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for replica chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosReplicaConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosReplicaConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct ChaosState {
    config: RwLock<ChaosReplicaConfig>,
    down: AtomicBool,
    fail_next: AtomicUsize,
}

impl ChaosState {
    /// Apply chaos checks: returns Err if the request should fail.
    async fn maybe_fail(&self) -> Result<(), ReplicaError> {
        if self.down.load(Ordering::Acquire) {
            return Err(ReplicaError::Failed("chaos: replica marked as failed".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(ReplicaError::Failed("chaos: injected one-shot failure".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(ReplicaError::Failed("chaos: random failure".into()));
        }
        Ok(())
    }
}

/// A [`Replica`] wrapper that injects chaos.
pub struct ChaosReplica<R: Replica> {
    inner: Arc<R>,
    state: Arc<ChaosState>,
}

impl<R: Replica> std::fmt::Debug for ChaosReplica<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosReplica")
            .field("name", &self.inner.name())
            .finish_non_exhaustive()
    }
}

impl<R: Replica> ChaosReplica<R> {
    pub fn new(inner: R, config: ChaosReplicaConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            state: Arc::new(ChaosState {
                config: RwLock::new(config),
                down: AtomicBool::new(false),
                fail_next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Fail every call until [`ChaosReplica::recover`].
    pub fn fail(&self) {
        self.state.down.store(true, Ordering::Release);
    }

    pub fn recover(&self) {
        self.state.down.store(false, Ordering::Release);
    }

    /// Fail exactly the next `n` calls, then behave normally.
    pub fn fail_next(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::Release);
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.state.config.write().await.failure_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.config.write().await.latency = latency;
    }

    fn chaotic_write<F>(&self, buckets: Arc<Buckets>, forward: F) -> OutcomeStream
    where
        F: FnOnce(&R, Arc<Buckets>) -> OutcomeStream + Send + 'static,
    {
        let state = self.state.clone();
        let inner = self.inner.clone();
        stream::once(async move {
            match state.maybe_fail().await {
                Ok(()) => forward(&*inner, buckets),
                Err(e) => {
                    let failed: Vec<Outcome> = buckets
                        .keys()
                        .map(|key| Outcome::err(key.clone(), e.clone()))
                        .collect();
                    stream::iter(failed).boxed()
                }
            }
        })
        .flatten()
        .boxed()
    }

    fn chaotic_names<F>(&self, forward: F) -> NameStream
    where
        F: FnOnce(&R) -> NameStream + Send + 'static,
    {
        let state = self.state.clone();
        let inner = self.inner.clone();
        stream::once(async move {
            match state.maybe_fail().await {
                Ok(()) => forward(&*inner),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            }
        })
        .flatten()
        .boxed()
    }
}

#[async_trait::async_trait]
impl<R: Replica> Replica for ChaosReplica<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn insert(&self, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream {
        self.chaotic_write(buckets, move |r, b| r.insert(b, limits))
    }

    fn delete(&self, buckets: Arc<Buckets>, limits: Arc<Limits>) -> OutcomeStream {
        self.chaotic_write(buckets, move |r, b| r.delete(b, limits))
    }

    async fn score(&self, pairs: &[KeyField]) -> Result<HashMap<KeyField, Presence>, ReplicaError> {
        self.state.maybe_fail().await?;
        self.inner.score(pairs).await
    }

    async fn select(&self, key: &str, fields: &[String]) -> Result<Vec<Entry>, ReplicaError> {
        self.state.maybe_fail().await?;
        self.inner.select(key, fields).await
    }

    async fn select_range(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entry>, ReplicaError> {
        self.state.maybe_fail().await?;
        self.inner.select_range(key, offset, limit).await
    }

    fn keys(&self) -> NameStream {
        self.chaotic_names(|r| r.keys())
    }

    fn members(&self, key: &str) -> NameStream {
        let key = key.to_string();
        self.chaotic_names(move |r| r.members(&key))
    }

    async fn size(&self, key: &str) -> Result<u64, ReplicaError> {
        self.state.maybe_fail().await?;
        self.inner.size(key).await
    }

    async fn purge(&self) -> Result<u64, ReplicaError> {
        self.state.maybe_fail().await?;
        self.inner.purge().await
    }

    async fn close(&self) -> Result<(), ReplicaError> {
        self.inner.close().await
    }
}

// ────────────────────────── Tests ──────────────────────────
