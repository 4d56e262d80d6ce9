//! Cardinality bookkeeping: a farm whose replicas track which fields exist
//! under each key, without values.

use crate::farm::{check_batch, Farm, FarmError, WriteKind};
use crate::replica::Buckets;
use farm_common::{now_ms, Entry, KeyField, Limits};
use std::sync::Arc;

#[derive(Debug)]
pub struct CounterFarm {
    farm: Farm,
}

impl CounterFarm {
    /// Wrap a farm over counter replicas. The farm must not have a counter
    /// of its own.
    pub fn new(farm: Farm) -> Self {
        Self { farm }
    }

    pub fn farm(&self) -> &Farm {
        &self.farm
    }

    /// Replay a data-farm write with the values stripped. Failures are only
    /// logged: the data write already happened.
    pub(crate) async fn mirror(&self, kind: WriteKind, buckets: &Buckets, limits: Arc<Limits>) {
        let stripped: Buckets = buckets
            .iter()
            .map(|(key, entries)| {
                let entries = entries
                    .iter()
                    .map(|e| Entry {
                        value: Vec::new(),
                        ..e.clone()
                    })
                    .collect();
                (key.clone(), entries)
            })
            .collect();
        match self.farm.apply(kind, Arc::new(stripped), limits).await {
            Ok(_) => {}
            Err(FarmError::Partial { reason, .. }) => {
                tracing::debug!(farm = self.farm.name(), "counter mirror partial: {reason}");
            }
            Err(e) => tracing::warn!(farm = self.farm.name(), "counter mirror failed: {e}"),
        }
    }

    /// Live fields under `key`.
    pub async fn cardinality(&self, key: &str) -> Result<u64, FarmError> {
        self.farm.size(key).await
    }

    /// Fail with `MaxSizeExceeded` if writing `entries` would take `key`
    /// past `max` live fields. Falls back to checking the batch alone when
    /// the counter replicas cannot answer.
    pub async fn check_ceiling(&self, key: &str, entries: &[Entry], max: u64) -> Result<(), FarmError> {
        if max == u64::MAX {
            return Ok(());
        }
        let pairs: Vec<KeyField> = entries.iter().map(Entry::key_field).collect();
        let (current, presence) =
            match tokio::try_join!(self.cardinality(key), self.farm.score(&pairs)) {
                Ok(answers) => answers,
                Err(e) => {
                    tracing::warn!(key, "cardinality unavailable, checking batch only: {e}");
                    return check_batch(key, entries.len() as u64, max);
                }
            };

        let now = now_ms();
        let new_fields = pairs
            .iter()
            .filter(|kf| {
                !presence
                    .get(*kf)
                    .is_some_and(|p| p.inserted && !p.is_expired(now))
            })
            .count() as u64;
        check_batch(key, current.saturating_add(new_fields), max)
    }

    pub async fn keys(&self) -> Result<Vec<String>, FarmError> {
        self.farm.keys().await
    }

    pub async fn members(&self, key: &str) -> Result<Vec<String>, FarmError> {
        self.farm.members(key).await
    }

    pub async fn scan(&self) -> Result<Vec<(String, Vec<String>)>, FarmError> {
        self.farm.scan().await
    }
}
