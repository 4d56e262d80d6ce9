//! Farm: applies writes and reads across a replicated set of storage
//! replicas.
//!
//! The farm:
//! 1. Buckets entries by key and checks cardinality ceilings
//! 2. Fans the batch out to every replica through its [`Tactic`]
//! 3. Tallies per-key outcomes into success, partial or complete failure
//! 4. Reads from the replicas its [`ReadStrategy`] picks and unions them
//! 5. Schedules repair on the background pool when replicas disagree

use crate::counter::CounterFarm;
use crate::pool::TaskPool;
use crate::repair::{self, RepairReport};
use crate::replica::{Buckets, Replica, ReplicaError};
use crate::strategy::{union, ReadStrategy};
use crate::sweeper::ExpiryIndex;
use crate::tactic::{FanOut, Tactic};
use farm_common::{
    bucket_by_key, now_ms, sort_by_score_desc, winning_presence, Entry, KeyField, Limits,
    Presence,
};
use farm_metrics::FarmMetrics;
use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Default bound on one repair run.
pub const DEFAULT_REPAIR_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FarmError {
    /// Some replicas failed or disagreed; `count` is the best-effort result.
    #[error("partial write ({count} changed): {reason}")]
    Partial { count: u64, reason: String },
    #[error("complete failure: {0}")]
    Complete(String),
    #[error("key {key:?} would hold {size} fields, max {max}")]
    MaxSizeExceeded { key: String, size: u64, max: u64 },
    #[error("rate limited: {requested} elements over budget")]
    RateLimited { requested: usize },
    #[error("not found")]
    NotFound,
    #[error("repair timed out")]
    RepairTimeout,
    #[error("repair failed: {0}")]
    Repair(String),
    #[error("farm has no replicas")]
    NoReplicas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Insert,
    Delete,
}

impl WriteKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

pub type ReplicaSet = Arc<[Arc<dyn Replica>]>;

pub struct Farm {
    name: String,
    replicas: RwLock<ReplicaSet>,
    tactic: Tactic,
    strategy: ReadStrategy,
    repair_timeout: Duration,
    pool: Arc<TaskPool>,
    metrics: Arc<FarmMetrics>,
    counter: Option<Arc<CounterFarm>>,
    expiry: Option<Arc<ExpiryIndex>>,
}

impl std::fmt::Debug for Farm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Farm")
            .field("name", &self.name)
            .field("tactic", &self.tactic)
            .field("strategy", &self.strategy)
            .field("counter", &self.counter.is_some())
            .finish_non_exhaustive()
    }
}

impl Farm {
    pub fn new(
        name: impl Into<String>,
        replicas: Vec<Arc<dyn Replica>>,
        tactic: Tactic,
        strategy: ReadStrategy,
        pool: Arc<TaskPool>,
        metrics: Arc<FarmMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            replicas: RwLock::new(replicas.into()),
            tactic,
            strategy,
            repair_timeout: DEFAULT_REPAIR_TIMEOUT,
            pool,
            metrics,
            counter: None,
            expiry: None,
        }
    }

    pub fn with_repair_timeout(mut self, timeout: Duration) -> Self {
        self.repair_timeout = timeout;
        self
    }

    /// Mirror writes into `counter` and check ceilings against it.
    pub fn with_counter(mut self, counter: Arc<CounterFarm>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Register inserted entries with an expiry for the sweeper.
    pub fn with_expiry_index(mut self, index: Arc<ExpiryIndex>) -> Self {
        self.expiry = Some(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> ReadStrategy {
        self.strategy
    }

    pub fn counter(&self) -> Option<&Arc<CounterFarm>> {
        self.counter.as_ref()
    }

    /// Current replica set.
    pub async fn replicas(&self) -> ReplicaSet {
        self.replicas.read().await.clone()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert `entries` on every replica. Per `(key, field)` only the highest
    /// score in the batch is sent.
    pub async fn insert(&self, entries: Vec<Entry>, limits: &Limits) -> Result<u64, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "insert");
        let buckets = Arc::new(bucket_by_key(entries));
        if buckets.is_empty() {
            return Ok(0);
        }
        for (key, bucket) in buckets.iter() {
            let ceiling = limits.for_key(key).size;
            match &self.counter {
                Some(counter) => counter.check_ceiling(key, bucket, ceiling).await?,
                None => check_batch(key, bucket.len() as u64, ceiling)?,
            }
        }

        let limits = Arc::new(limits.clone());
        let (result, contacted) = self
            .write(WriteKind::Insert, buckets.clone(), limits.clone())
            .await;
        if contacted && landed(&result) {
            if let Some(counter) = &self.counter {
                counter.mirror(WriteKind::Insert, &buckets, limits.clone()).await;
            }
            self.register_expiry(&buckets, &limits);
        }
        result
    }

    /// Write tombstones for `entries` on every replica.
    pub async fn delete(&self, entries: Vec<Entry>, limits: &Limits) -> Result<u64, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "delete");
        let buckets = Arc::new(bucket_by_key(entries));
        if buckets.is_empty() {
            return Ok(0);
        }
        let limits = Arc::new(limits.clone());
        let (result, contacted) = self
            .write(WriteKind::Delete, buckets.clone(), limits.clone())
            .await;
        if contacted && landed(&result) {
            if let Some(counter) = &self.counter {
                counter.mirror(WriteKind::Delete, &buckets, limits.clone()).await;
            }
            // Expiring tombstones are reclaimed by the sweeper like inserts.
            self.register_expiry(&buckets, &limits);
        }
        result
    }

    /// Undo an insert by deleting the same entries.
    pub async fn rollback(&self, entries: Vec<Entry>, limits: &Limits) -> Result<u64, FarmError> {
        tracing::debug!(farm = %self.name, entries = entries.len(), "rollback");
        self.delete(entries, limits).await
    }

    /// Fan a bucketed write out to every replica and tally the outcomes.
    /// Skips ceilings, mirroring and expiry registration.
    pub(crate) async fn apply(
        &self,
        kind: WriteKind,
        buckets: Arc<Buckets>,
        limits: Arc<Limits>,
    ) -> Result<u64, FarmError> {
        self.write(kind, buckets, limits).await.0
    }

    /// Like [`Farm::apply`], also reporting whether any replica was contacted.
    async fn write(
        &self,
        kind: WriteKind,
        buckets: Arc<Buckets>,
        limits: Arc<Limits>,
    ) -> (Result<u64, FarmError>, bool) {
        let replicas = self.replicas().await;
        if replicas.is_empty() {
            return (Err(FarmError::NoReplicas), false);
        }
        let elements = buckets.values().map(Vec::len).sum();
        let fan = self.fan_out(&replicas, elements, |r| match kind {
            WriteKind::Insert => r.insert(buckets.clone(), limits.clone()),
            WriteKind::Delete => r.delete(buckets.clone(), limits.clone()),
        });
        let mut fan = match fan {
            Ok(fan) => fan,
            Err(e) => return (Err(e), false),
        };

        let mut tallies: BTreeMap<String, KeyTally> = BTreeMap::new();
        while let Some((idx, outcome)) = fan.rx.recv().await {
            if let Err(e) = &outcome.result {
                tracing::debug!(
                    farm = %self.name,
                    replica = replicas[idx].name(),
                    key = %outcome.key,
                    "{} failed: {e}",
                    kind.as_str()
                );
            }
            tallies.entry(outcome.key).or_default().record(outcome.result);
        }

        let summary = summarize(buckets.keys(), &tallies, fan.contacted);
        if !summary.repair.is_empty() {
            self.metrics.partial_writes.with_label_values(&[self.name.as_str()]).inc();
            tracing::warn!(
                farm = %self.name,
                keys = summary.repair.len(),
                "{} incomplete, scheduling repair",
                kind.as_str()
            );
            let pairs = summary
                .repair
                .iter()
                .filter_map(|key| buckets.get(key))
                .flatten()
                .map(Entry::key_field)
                .collect();
            self.schedule_repair(replicas, pairs);
        }
        (summary.result, fan.contacted > 0)
    }

    fn register_expiry(&self, buckets: &Buckets, limits: &Limits) {
        let Some(index) = &self.expiry else {
            return;
        };
        let now = now_ms();
        for (key, bucket) in buckets.iter() {
            let expires_at = limits.for_key(key).expires_at(now);
            for entry in bucket {
                index.register(&entry.key, &entry.field, expires_at);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Freshest live entry for `(key, field)`.
    pub async fn select(&self, key: &str, field: &str) -> Result<Entry, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "select");
        let chosen = self.choose().await?;
        let wanted = vec![field.to_string()];
        let answers = self
            .gather("select", &chosen, 1, |r| {
                let key = key.to_string();
                let wanted = wanted.clone();
                async move { r.select(&key, &wanted).await }
            })
            .await?;

        let merged = self.merge(&chosen, answers).await;
        merged
            .into_iter()
            .find(|e| e.key == key && e.field == field)
            .ok_or(FarmError::NotFound)
    }

    /// Up to `limit` entries per key after skipping `offset`, highest score
    /// first within each key, keys in the order given.
    pub async fn select_range(
        &self,
        keys: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entry>, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "select_range");
        let mut seen = HashSet::new();
        let keys: Vec<String> = keys.iter().filter(|k| seen.insert(*k)).cloned().collect();
        if keys.is_empty() || limit == 0 {
            return Err(FarmError::NotFound);
        }
        let window = offset.saturating_add(limit);
        let chosen = self.choose().await?;
        let answers = self
            .gather("select_range", &chosen, keys.len(), |r| {
                let keys = keys.clone();
                async move {
                    let mut out = Vec::new();
                    for key in &keys {
                        out.extend(r.select_range(key, 0, window).await?);
                    }
                    Ok(out)
                }
            })
            .await?;

        let mut per_key: HashMap<String, Vec<Entry>> = HashMap::new();
        for entry in self.merge(&chosen, answers).await {
            per_key.entry(entry.key.clone()).or_default().push(entry);
        }
        let mut result = Vec::new();
        for key in &keys {
            let Some(mut entries) = per_key.remove(key) else {
                continue;
            };
            sort_by_score_desc(&mut entries);
            result.extend(entries.into_iter().skip(offset).take(limit));
        }
        if result.is_empty() {
            return Err(FarmError::NotFound);
        }
        Ok(result)
    }

    /// Every key known to the replicas the strategy picks, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "keys");
        let chosen = self.choose().await?;
        let answers = self
            .gather("keys", &chosen, 1, |r| r.keys().try_collect::<Vec<_>>())
            .await?;
        Ok(union_names(answers))
    }

    /// Every field known under `key`, sorted.
    pub async fn members(&self, key: &str) -> Result<Vec<String>, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "members");
        let chosen = self.choose().await?;
        let answers = self
            .gather("members", &chosen, 1, |r| r.members(key).try_collect::<Vec<_>>())
            .await?;
        Ok(union_names(answers))
    }

    /// Live cardinality of `key`: the largest any replica reports.
    pub async fn size(&self, key: &str) -> Result<u64, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "size");
        let replicas = self.replicas_or_err().await?;
        let answers = self
            .gather("size", &replicas, 1, |r| {
                let key = key.to_string();
                async move { r.size(&key).await }
            })
            .await?;
        Ok(answers.into_iter().max().unwrap_or(0))
    }

    /// Winning stored state per pair across every replica that answered.
    pub async fn score(&self, pairs: &[KeyField]) -> Result<HashMap<KeyField, Presence>, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "score");
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }
        let replicas = self.replicas_or_err().await?;
        let pairs: Arc<[KeyField]> = pairs.into();
        let answers = self
            .gather("score", &replicas, pairs.len(), |r| {
                let pairs = pairs.clone();
                async move { r.score(&pairs).await }
            })
            .await?;

        Ok(pairs
            .iter()
            .map(|kf| {
                let winner =
                    winning_presence(answers.iter().filter_map(|answer| answer.get(kf)));
                (kf.clone(), winner)
            })
            .collect())
    }

    /// Every known key with its known fields.
    pub async fn scan(&self) -> Result<Vec<(String, Vec<String>)>, FarmError> {
        let mut out = Vec::new();
        for key in self.keys().await? {
            let fields = self.members(&key).await?;
            if !fields.is_empty() {
                out.push((key, fields));
            }
        }
        Ok(out)
    }

    /// Physically remove expired records, tombstones included, on every
    /// replica. Returns the total removed.
    pub async fn purge(&self) -> Result<u64, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "purge");
        let replicas = self.replicas_or_err().await?;
        let answers = self
            .gather("purge", &replicas, 1, |r| async move { r.purge().await })
            .await?;
        Ok(answers.into_iter().sum())
    }

    /// Reconcile `pairs` across the whole replica set now.
    pub async fn repair(&self, pairs: &[KeyField]) -> Result<RepairReport, FarmError> {
        let _timer = self.metrics.start_op(&self.name, "repair");
        let replicas = self.replicas_or_err().await?;
        let report = repair::repair(&replicas, pairs, self.repair_timeout).await?;
        self.metrics
            .repair_corrections
            .with_label_values(&[self.name.as_str()])
            .inc_by(report.corrected);
        Ok(report)
    }

    /// Replace the replica set. The old replicas are closed once swapped out.
    pub async fn topology(&self, replicas: Vec<Arc<dyn Replica>>) {
        let new: ReplicaSet = replicas.into();
        let old = {
            let mut current = self.replicas.write().await;
            std::mem::replace(&mut *current, new)
        };
        tracing::info!(
            farm = %self.name,
            old = old.len(),
            new = self.replicas.read().await.len(),
            "topology changed"
        );
        for replica in old.iter() {
            if let Err(e) = replica.close().await {
                tracing::warn!(farm = %self.name, replica = replica.name(), "close failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    async fn replicas_or_err(&self) -> Result<ReplicaSet, FarmError> {
        let replicas = self.replicas().await;
        if replicas.is_empty() {
            return Err(FarmError::NoReplicas);
        }
        Ok(replicas)
    }

    /// Replicas to read from under the strategy.
    async fn choose(&self) -> Result<Vec<Arc<dyn Replica>>, FarmError> {
        let replicas = self.replicas_or_err().await?;
        Ok(self.strategy.choose(&replicas))
    }

    fn fan_out<T, F>(
        &self,
        replicas: &[Arc<dyn Replica>],
        elements: usize,
        f: F,
    ) -> Result<FanOut<T>, FarmError>
    where
        T: Send + 'static,
        F: Fn(&Arc<dyn Replica>) -> BoxStream<'static, T>,
    {
        self.tactic.fan_out(replicas, elements, f).inspect_err(|e| {
            if matches!(e, FarmError::RateLimited { .. }) {
                self.metrics.rate_limited.with_label_values(&[self.name.as_str()]).inc();
            }
        })
    }

    /// Run one call per replica and keep the answers. Fails with
    /// `Complete` only if every contacted replica errored.
    async fn gather<T, F, Fut>(
        &self,
        op: &'static str,
        replicas: &[Arc<dyn Replica>],
        elements: usize,
        f: F,
    ) -> Result<Vec<T>, FarmError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Replica>) -> Fut,
        Fut: Future<Output = Result<T, ReplicaError>> + Send + 'static,
    {
        let mut fan = self.fan_out(replicas, elements, |r| stream::once(f(r.clone())).boxed())?;
        let mut answers = Vec::with_capacity(fan.contacted);
        let mut failures = Vec::new();
        while let Some((idx, result)) = fan.rx.recv().await {
            match result {
                Ok(answer) => answers.push(answer),
                Err(e) => {
                    tracing::debug!(farm = %self.name, replica = replicas[idx].name(), "{op} failed: {e}");
                    failures.push(format!("{}: {e}", replicas[idx].name()));
                }
            }
        }
        if answers.is_empty() && !failures.is_empty() {
            return Err(FarmError::Complete(format!("{op}: {}", failures.join("; "))));
        }
        Ok(answers)
    }

    /// Union read answers and schedule repair for anything stale.
    ///
    /// Replicas only answer reads with live inserts, so a replica that
    /// missed a delete can hand back an older insert. Every divergent winner
    /// is checked against the stored state of the contacted replicas and
    /// dropped when a tombstone (or a newer record) beats it there.
    async fn merge(&self, chosen: &[Arc<dyn Replica>], answers: Vec<Vec<Entry>>) -> Vec<Entry> {
        let merged = union(&answers);
        if merged.divergent.is_empty() || !self.strategy.detects_divergence() {
            return merged.entries;
        }
        tracing::debug!(
            farm = %self.name,
            pairs = merged.divergent.len(),
            "read found divergence"
        );
        let stored = self.stored_winners(chosen, &merged.divergent).await;
        let replicas = self.replicas().await;
        self.schedule_repair(replicas, merged.divergent);

        merged
            .entries
            .into_iter()
            .filter(|entry| match stored.get(&entry.key_field()) {
                Some(winner) => !winner.wins_over(&Presence::inserted(entry.score, 0)),
                None => true,
            })
            .collect()
    }

    /// Winning stored state of `pairs` over the replicas that answer.
    async fn stored_winners(
        &self,
        replicas: &[Arc<dyn Replica>],
        pairs: &[KeyField],
    ) -> HashMap<KeyField, Presence> {
        let answers = join_all(replicas.iter().map(|r| r.score(pairs))).await;
        let mut stored: Vec<HashMap<KeyField, Presence>> = Vec::with_capacity(answers.len());
        for (replica, answer) in replicas.iter().zip(answers) {
            match answer {
                Ok(scores) => stored.push(scores),
                Err(e) => {
                    tracing::debug!(farm = %self.name, replica = replica.name(), "score failed: {e}")
                }
            }
        }
        pairs
            .iter()
            .map(|kf| {
                let winner = winning_presence(stored.iter().filter_map(|scores| scores.get(kf)));
                (kf.clone(), winner)
            })
            .collect()
    }

    fn schedule_repair(&self, replicas: ReplicaSet, pairs: Vec<KeyField>) {
        repair::spawn_repair(
            &self.pool,
            &self.metrics,
            &self.name,
            replicas,
            pairs,
            self.repair_timeout,
        );
    }
}

/// Whether a write reached at least one replica for some key.
fn landed(result: &Result<u64, FarmError>) -> bool {
    matches!(result, Ok(_) | Err(FarmError::Partial { .. }))
}

/// Reject a batch that alone exceeds `max` fields.
pub(crate) fn check_batch(key: &str, size: u64, max: u64) -> Result<(), FarmError> {
    if size > max {
        return Err(FarmError::MaxSizeExceeded {
            key: key.to_string(),
            size,
            max,
        });
    }
    Ok(())
}

fn union_names(answers: Vec<Vec<String>>) -> Vec<String> {
    answers
        .into_iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ---------------------------------------------------------------------------
// Write tally
// ---------------------------------------------------------------------------

/// Outcomes for one key across replicas.
#[derive(Debug, Default)]
struct KeyTally {
    counts: Vec<u64>,
    errors: Vec<ReplicaError>,
}

impl KeyTally {
    fn record(&mut self, result: Result<u64, ReplicaError>) {
        match result {
            Ok(n) => self.counts.push(n),
            Err(e) => self.errors.push(e),
        }
    }
}

#[derive(Debug)]
struct WriteSummary {
    result: Result<u64, FarmError>,
    /// Keys that landed somewhere but not identically everywhere.
    repair: Vec<String>,
}

/// Most common count; ties go to the larger count.
fn agreed_count(counts: &[u64]) -> u64 {
    let mut freq: BTreeMap<u64, usize> = BTreeMap::new();
    for &c in counts {
        *freq.entry(c).or_default() += 1;
    }
    freq.into_iter()
        .max_by(|(a, fa), (b, fb)| fa.cmp(fb).then(a.cmp(b)))
        .map(|(count, _)| count)
        .unwrap_or(0)
}

fn summarize<'a>(
    keys: impl Iterator<Item = &'a String>,
    tallies: &BTreeMap<String, KeyTally>,
    contacted: usize,
) -> WriteSummary {
    if contacted == 0 {
        return WriteSummary {
            result: Ok(0),
            repair: Vec::new(),
        };
    }
    let empty = KeyTally::default();
    let mut count = 0u64;
    let mut total = 0usize;
    let mut failed = 0usize;
    let mut reasons = Vec::new();
    let mut repair = Vec::new();
    let mut max_size = None;
    let mut only_max_size = true;

    for key in keys {
        total += 1;
        let tally = tallies.get(key).unwrap_or(&empty);
        let missing = contacted.saturating_sub(tally.counts.len() + tally.errors.len());

        if tally.counts.is_empty() {
            failed += 1;
            for e in &tally.errors {
                match e {
                    ReplicaError::MaxSize { key, size, max } => {
                        max_size.get_or_insert(FarmError::MaxSizeExceeded {
                            key: key.clone(),
                            size: *size,
                            max: *max,
                        });
                    }
                    _ => only_max_size = false,
                }
            }
            if missing > 0 {
                only_max_size = false;
            }
            let first = tally
                .errors
                .first()
                .map(ToString::to_string)
                .unwrap_or_else(|| "no answer".to_string());
            reasons.push(format!("{key}: failed on every replica ({first})"));
            continue;
        }

        count += agreed_count(&tally.counts);
        let bad = tally.errors.len() + missing;
        if bad > 0 {
            reasons.push(format!("{key}: {bad} of {contacted} replicas failed"));
            repair.push(key.clone());
        } else if tally.counts.windows(2).any(|w| w[0] != w[1]) {
            reasons.push(format!("{key}: replica counts differ {:?}", tally.counts));
            repair.push(key.clone());
        }
    }

    let result = if total > 0 && failed == total {
        match max_size {
            Some(e) if only_max_size => Err(e),
            _ => Err(FarmError::Complete(reasons.join("; "))),
        }
    } else if !reasons.is_empty() {
        Err(FarmError::Partial {
            count,
            reason: reasons.join("; "),
        })
    } else {
        Ok(count)
    };
    WriteSummary { result, repair }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalReplica;
    use farm_common::SizeExpiry;
    use farm_storage::StorageEngine;

    fn tallies(rows: &[(&str, Vec<Result<u64, ReplicaError>>)]) -> BTreeMap<String, KeyTally> {
        rows.iter()
            .map(|(key, results)| {
                let mut t = KeyTally::default();
                for r in results {
                    t.record(r.clone());
                }
                (key.to_string(), t)
            })
            .collect()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn failed() -> Result<u64, ReplicaError> {
        Err(ReplicaError::Failed("down".into()))
    }

    #[test]
    fn test_agreed_count() {
        assert_eq!(agreed_count(&[2, 2, 1]), 2);
        assert_eq!(agreed_count(&[1, 3]), 3);
        assert_eq!(agreed_count(&[4]), 4);
        assert_eq!(agreed_count(&[]), 0);
    }

    #[test]
    fn test_summarize_clean() {
        let t = tallies(&[("a", vec![Ok(2), Ok(2), Ok(2)]), ("b", vec![Ok(1), Ok(1), Ok(1)])]);
        let s = summarize(keys(&["a", "b"]).iter(), &t, 3);
        assert_eq!(s.result, Ok(3));
        assert!(s.repair.is_empty());
    }

    #[test]
    fn test_summarize_partial_on_error_or_silence() {
        let t = tallies(&[("a", vec![Ok(1), Ok(1), failed()]), ("b", vec![Ok(1), Ok(1)])]);
        let s = summarize(keys(&["a", "b"]).iter(), &t, 3);
        assert!(matches!(s.result, Err(FarmError::Partial { count: 2, .. })));
        assert_eq!(s.repair, keys(&["a", "b"]));
    }

    #[test]
    fn test_summarize_divergent_counts() {
        let t = tallies(&[("a", vec![Ok(1), Ok(0), Ok(0)])]);
        let s = summarize(keys(&["a"]).iter(), &t, 3);
        assert!(matches!(s.result, Err(FarmError::Partial { count: 0, .. })));
        assert_eq!(s.repair, keys(&["a"]));
    }

    #[test]
    fn test_summarize_complete_failure() {
        let t = tallies(&[("a", vec![failed(), failed()])]);
        let s = summarize(keys(&["a"]).iter(), &t, 2);
        assert!(matches!(s.result, Err(FarmError::Complete(_))));
        assert!(s.repair.is_empty());
    }

    #[test]
    fn test_summarize_max_size_everywhere() {
        let e = ReplicaError::MaxSize {
            key: "a".into(),
            size: 3,
            max: 2,
        };
        let t = tallies(&[("a", vec![Err(e.clone()), Err(e)])]);
        let s = summarize(keys(&["a"]).iter(), &t, 2);
        assert_eq!(
            s.result,
            Err(FarmError::MaxSizeExceeded {
                key: "a".into(),
                size: 3,
                max: 2
            })
        );
    }

    #[test]
    fn test_summarize_one_key_failed_is_partial() {
        let t = tallies(&[("a", vec![failed(), failed()]), ("b", vec![Ok(1), Ok(1)])]);
        let s = summarize(keys(&["a", "b"]).iter(), &t, 2);
        assert!(matches!(s.result, Err(FarmError::Partial { count: 1, .. })));
        assert!(s.repair.is_empty());
    }

    #[test]
    fn test_summarize_nothing_contacted() {
        let s = summarize(keys(&["a"]).iter(), &BTreeMap::new(), 0);
        assert_eq!(s.result, Ok(0));
    }

    fn farm(n: usize, strategy: ReadStrategy) -> (Farm, Arc<TaskPool>) {
        let metrics = Arc::new(FarmMetrics::new().unwrap());
        let (pool, _rx) = TaskPool::new(16, metrics.clone());
        let pool = Arc::new(pool);
        let replicas = (0..n)
            .map(|i| {
                Arc::new(LocalReplica::new(format!("r{i}"), StorageEngine::in_memory(2)))
                    as Arc<dyn Replica>
            })
            .collect();
        let farm = Farm::new("test", replicas, Tactic::NonBlocking, strategy, pool.clone(), metrics);
        (farm, pool)
    }

    #[tokio::test]
    async fn test_insert_select_delete() {
        let (farm, _pool) = farm(3, ReadStrategy::ReadAll);
        let limits = Limits::default();
        let n = farm
            .insert(vec![Entry::new("k", "f", 1.0, "v")], &limits)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(farm.select("k", "f").await.unwrap().value, b"v");
        assert_eq!(farm.size("k").await.unwrap(), 1);

        farm.delete(vec![Entry::tombstone("k", "f", 2.0)], &limits)
            .await
            .unwrap();
        assert_eq!(farm.select("k", "f").await, Err(FarmError::NotFound));
        let scores = farm.score(&[KeyField::new("k", "f")]).await.unwrap();
        assert_eq!(scores[&KeyField::new("k", "f")], Presence::deleted(2.0, 0));
    }

    #[tokio::test]
    async fn test_ceiling_without_counter_checks_batch() {
        let (farm, _pool) = farm(2, ReadStrategy::ReadAll);
        let limits = Limits::new(SizeExpiry::new(1, Duration::ZERO));
        let err = farm
            .insert(
                vec![Entry::new("k", "a", 1.0, ""), Entry::new("k", "b", 1.0, "")],
                &limits,
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FarmError::MaxSizeExceeded {
                key: "k".into(),
                size: 2,
                max: 1
            }
        );
        assert_eq!(farm.keys().await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_select_range_slices_per_key() {
        let (farm, _pool) = farm(2, ReadStrategy::ReadAll);
        let entries = (0..5)
            .map(|i| Entry::new("a", format!("f{i}"), i as f64, ""))
            .chain([Entry::new("b", "only", 9.0, "")])
            .collect();
        farm.insert(entries, &Limits::default()).await.unwrap();

        let got = farm
            .select_range(&keys(&["b", "a", "b"]), 1, 2)
            .await
            .unwrap();
        let fields: Vec<&str> = got.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["f3", "f2"]);

        assert_eq!(
            farm.select_range(&keys(&["missing"]), 0, 10).await,
            Err(FarmError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_blocked_write_is_not_mirrored_or_indexed() {
        let metrics = Arc::new(FarmMetrics::new().unwrap());
        let (pool, _rx) = TaskPool::new(16, metrics.clone());
        let pool = Arc::new(pool);
        let replica = |name: &str| {
            Arc::new(LocalReplica::new(name, StorageEngine::in_memory(1))) as Arc<dyn Replica>
        };
        let counter = Arc::new(CounterFarm::new(Farm::new(
            "counter",
            vec![replica("c0")],
            Tactic::NonBlocking,
            ReadStrategy::ReadAll,
            pool.clone(),
            metrics.clone(),
        )));
        let index = Arc::new(ExpiryIndex::new(Duration::from_millis(50)));
        let farm = Farm::new(
            "data",
            vec![replica("r0")],
            Tactic::Blocking,
            ReadStrategy::ReadAll,
            pool,
            metrics,
        )
        .with_counter(counter.clone())
        .with_expiry_index(index.clone());

        let expiring = Limits::new(SizeExpiry::new(u64::MAX, Duration::from_secs(60)));
        assert_eq!(
            farm.insert(vec![Entry::new("k", "f", 1.0, "v")], &expiring).await,
            Ok(0)
        );
        assert_eq!(
            farm.delete(vec![Entry::tombstone("k", "g", 1.0)], &expiring).await,
            Ok(0)
        );
        assert_eq!(counter.cardinality("k").await.unwrap(), 0);
        let kf = KeyField::new("k", "g");
        assert_eq!(counter.farm().score(&[kf.clone()]).await.unwrap()[&kf], Presence::ABSENT);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_empty_farm() {
        let (farm, _pool) = farm(0, ReadStrategy::ReadOne);
        assert_eq!(farm.select("k", "f").await, Err(FarmError::NoReplicas));
        assert_eq!(
            farm.insert(vec![Entry::new("k", "f", 1.0, "")], &Limits::default())
                .await,
            Err(FarmError::NoReplicas)
        );
    }

    #[tokio::test]
    async fn test_scan_lists_keys_and_fields() {
        let (farm, _pool) = farm(2, ReadStrategy::ReadQuorum(0.5));
        farm.insert(
            vec![
                Entry::new("a", "x", 1.0, ""),
                Entry::new("a", "y", 1.0, ""),
                Entry::new("b", "z", 1.0, ""),
            ],
            &Limits::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            farm.scan().await.unwrap(),
            vec![
                ("a".to_string(), keys(&["x", "y"])),
                ("b".to_string(), keys(&["z"])),
            ]
        );
    }
}
