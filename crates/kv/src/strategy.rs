//! Read strategies and the union used to merge replica answers.

use farm_common::{Entry, KeyField};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How many replicas a read contacts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadStrategy {
    /// One random replica; no divergence detection.
    ReadOne,
    /// `ceil(N * q)` random replicas, `q` in (0, 1].
    ReadQuorum(f64),
    /// Every replica.
    ReadAll,
}

impl ReadStrategy {
    /// Number of replicas to contact out of `n`, clamped to `1..=n`.
    pub fn replica_count(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let wanted = match *self {
            Self::ReadOne => 1,
            Self::ReadQuorum(q) => (n as f64 * q).ceil() as usize,
            Self::ReadAll => n,
        };
        wanted.clamp(1, n)
    }

    /// Random sample of `replica_count` items.
    pub fn choose<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let count = self.replica_count(items.len());
        if count == items.len() {
            return items.to_vec();
        }
        items
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect()
    }

    pub fn detects_divergence(&self) -> bool {
        !matches!(self, Self::ReadOne)
    }
}

/// Merged view of several replicas' answers.
#[derive(Debug, Default)]
pub struct Union {
    /// Highest-score entry per `(key, field)`, in `(key, field)` order.
    pub entries: Vec<Entry>,
    /// Pairs missing or stale on at least one responding replica.
    pub divergent: Vec<KeyField>,
}

/// Union the answers of the replicas that responded, keeping the highest
/// score per `(key, field)`, and collect every pair some replica lacks or
/// holds at a lower score.
pub fn union(responses: &[Vec<Entry>]) -> Union {
    let mut best: BTreeMap<KeyField, Entry> = BTreeMap::new();
    for entry in responses.iter().flatten() {
        match best.get(&entry.key_field()) {
            Some(existing) if existing.score >= entry.score => {}
            _ => {
                best.insert(entry.key_field(), entry.clone());
            }
        }
    }

    let mut divergent = BTreeSet::new();
    for response in responses {
        let seen: HashMap<KeyField, f64> = response
            .iter()
            .map(|e| (e.key_field(), e.score))
            .collect();
        for (kf, winner) in &best {
            if !is_current(seen.get(kf).copied(), winner.score) {
                divergent.insert(kf.clone());
            }
        }
    }

    Union {
        entries: best.into_values().collect(),
        divergent: divergent.into_iter().collect(),
    }
}

/// Whether a replica's view of an entry matches the union winner.
fn is_current(theirs: Option<f64>, winner: f64) -> bool {
    matches!(theirs, Some(score) if score >= winner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
