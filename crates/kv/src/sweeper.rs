//! Expiry sweeper: deletes entries whose expiry has passed.
//!
//! Written entries are indexed into time buckets one window wide. Every
//! interval the sweeper pops the buckets that are due, re-reads the stored
//! state through the farm and deletes what really expired. Every few
//! intervals a full sweep walks every known key on the background pool to
//! catch anything the index missed (restarts, writes from elsewhere).

use crate::counter::CounterFarm;
use crate::farm::{Farm, FarmError};
use crate::pool::TaskPool;
use farm_common::{now_ms, Entry, KeyField, Limits, SizeExpiry};
use farm_metrics::FarmMetrics;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, MissedTickBehavior};

/// An entry waiting for its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pending {
    pub key: String,
    pub field: String,
    pub expires_at: u64,
}

/// Pending entries grouped into window-wide time buckets.
#[derive(Debug)]
pub struct ExpiryIndex {
    window_ms: u64,
    buckets: Mutex<BTreeMap<u64, HashSet<Pending>>>,
}

impl ExpiryIndex {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: (window.as_millis() as u64).max(1),
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Time after which an entry expiring at `expires_at` is swept.
    pub fn bucket_for(&self, expires_at: u64) -> u64 {
        expires_at.div_ceil(self.window_ms) * self.window_ms + self.window_ms
    }

    /// Remember an entry. `expires_at == 0` never expires and is ignored.
    pub fn register(&self, key: &str, field: &str, expires_at: u64) {
        if expires_at == 0 {
            return;
        }
        let bucket = self.bucket_for(expires_at);
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(bucket)
            .or_default()
            .insert(Pending {
                key: key.to_string(),
                field: field.to_string(),
                expires_at,
            });
    }

    /// Remove and return everything in buckets due at or before `now`.
    pub fn take_due(&self, now: u64) -> Vec<Pending> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let later = buckets.split_off(&now.saturating_add(1));
        std::mem::replace(&mut *buckets, later)
            .into_values()
            .flatten()
            .collect()
    }

    /// Pending entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one reap pass found.
#[derive(Debug, Default)]
struct Reaped {
    /// Expired inserts deleted.
    deleted: u64,
    /// Expired tombstones still physically stored.
    stale_tombstones: u64,
}

#[derive(Debug)]
pub struct Sweeper {
    farm: Arc<Farm>,
    counter: Option<Arc<CounterFarm>>,
    index: Arc<ExpiryIndex>,
    pool: Arc<TaskPool>,
    metrics: Arc<FarmMetrics>,
    full_sweep_every: u32,
}

impl Sweeper {
    pub fn new(
        farm: Arc<Farm>,
        index: Arc<ExpiryIndex>,
        pool: Arc<TaskPool>,
        metrics: Arc<FarmMetrics>,
    ) -> Self {
        Self {
            counter: farm.counter().cloned(),
            farm,
            index,
            pool,
            metrics,
            full_sweep_every: 10,
        }
    }

    /// Run a full sweep every `n` intervals; 0 disables full sweeps.
    pub fn with_full_sweep_every(mut self, n: u32) -> Self {
        self.full_sweep_every = n;
        self
    }

    /// Time between interval sweeps: nine tenths of a window.
    pub fn interval(&self) -> Duration {
        let window = self.index.window();
        window - window / 10
    }

    /// Reap the index buckets due at `now`. Returns how many entries were
    /// deleted. Due tombstones that have expired are purged.
    pub async fn sweep_interval(&self, now: u64) -> Result<u64, FarmError> {
        self.metrics.sweeps.with_label_values(&["interval"]).inc();
        let due = self.index.take_due(now);
        if due.is_empty() {
            return Ok(0);
        }
        let pairs: Vec<KeyField> = due
            .into_iter()
            .map(|p| KeyField::new(p.key, p.field))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        tracing::debug!(pairs = pairs.len(), "interval sweep");
        let reaped = self.reap(pairs, now).await?;
        if reaped.stale_tombstones > 0 {
            self.purge().await;
        }
        Ok(reaped.deleted)
    }

    /// Walk every known key in random order and reap what expired, then
    /// purge every expired record the replicas still hold.
    pub async fn sweep_full(&self, now: u64) -> Result<u64, FarmError> {
        self.metrics.sweeps.with_label_values(&["full"]).inc();
        let mut listing = match &self.counter {
            Some(counter) => counter.scan().await?,
            None => self.farm.scan().await?,
        };
        listing.shuffle(&mut rand::thread_rng());

        let mut deleted = 0;
        for (key, fields) in listing {
            let pairs = fields
                .into_iter()
                .map(|field| KeyField::new(key.clone(), field))
                .collect();
            match self.reap(pairs, now).await {
                Ok(reaped) => deleted += reaped.deleted,
                Err(e) => tracing::warn!(key = %key, "full sweep skipped key: {e}"),
            }
        }
        let purged = self.purge().await;
        tracing::info!(deleted, purged, "full sweep done");
        Ok(deleted)
    }

    /// Physically remove expired records from the farm and its counter farm.
    /// Failures are logged; the next sweep retries.
    async fn purge(&self) -> u64 {
        let mut purged = 0;
        let farms = std::iter::once(self.farm.as_ref())
            .chain(self.counter.as_ref().map(|counter| counter.farm()));
        for farm in farms {
            match farm.purge().await {
                Ok(n) => purged += n,
                Err(e) => tracing::warn!(farm = farm.name(), "purge failed: {e}"),
            }
        }
        self.metrics.sweeper_purged.inc_by(purged);
        purged
    }

    /// Delete the pairs whose stored insert has expired. Pairs not yet due
    /// go back into the index under their stored expiry.
    async fn reap(&self, pairs: Vec<KeyField>, now: u64) -> Result<Reaped, FarmError> {
        let presence = self.farm.score(&pairs).await?;
        let mut reaped = Reaped::default();
        let mut expired = Vec::new();
        for kf in pairs {
            let Some(p) = presence.get(&kf) else {
                continue;
            };
            if !p.present {
                continue;
            }
            if !p.is_expired(now) {
                if p.expires_at != 0 {
                    self.index.register(&kf.key, &kf.field, p.expires_at);
                }
            } else if p.inserted {
                expired.push(Entry::tombstone(kf.key, kf.field, p.score + 1.0));
            } else {
                reaped.stale_tombstones += 1;
            }
        }
        if expired.is_empty() {
            return Ok(reaped);
        }

        let count = expired.len() as u64;
        let limits = Limits::new(SizeExpiry::new(u64::MAX, self.index.window()));
        match self.farm.delete(expired, &limits).await {
            Ok(_) => {}
            Err(FarmError::Partial { reason, .. }) => {
                tracing::debug!("sweeper delete partial: {reason}");
            }
            Err(e) => return Err(e),
        }
        self.metrics.sweeper_expired.inc_by(count);
        reaped.deleted = count;
        Ok(reaped)
    }

    /// Run interval sweeps until the pool shuts down.
    pub fn spawn(self: Arc<Self>) {
        let pool = self.pool.clone();
        let token = pool.token();
        pool.spawn_service(async move {
            let mut ticker = tokio::time::interval(self.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            tracing::info!(interval_ms = self.interval().as_millis() as u64, "expiry sweeper started");

            let mut ticks: u32 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                ticks = ticks.wrapping_add(1);
                if let Err(e) = self.sweep_interval(now_ms()).await {
                    tracing::warn!("interval sweep failed: {e}");
                }
                if self.full_sweep_every > 0 && ticks % self.full_sweep_every == 0 {
                    let sweeper = self.clone();
                    self.pool.spawn("full_sweep", async move {
                        sweeper.sweep_full(now_ms()).await.map(|_| ())
                    });
                }
            }
            tracing::info!("expiry sweeper stopped");
        });
    }
}
