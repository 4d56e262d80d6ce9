//! Anti-entropy: bring every replica's view of a set of pairs in line with
//! the winning record.

use crate::farm::{FarmError, ReplicaSet};
use crate::pool::TaskPool;
use crate::replica::{Outcome, Replica};
use farm_common::{
    bucket_by_key, now_ms, winning_presence, Entry, KeyField, Limits, Presence, SizeExpiry,
};
use farm_metrics::FarmMetrics;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Distinct pairs examined.
    pub checked: usize,
    /// Records changed by corrective writes.
    pub corrected: u64,
}

/// A batch of corrective writes for one replica sharing op and expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Correction {
    replica: usize,
    insert: bool,
    expires_at: u64,
}

/// Reconcile `pairs` across `replicas`, bounded by `timeout` end to end.
pub async fn repair(
    replicas: &[Arc<dyn Replica>],
    pairs: &[KeyField],
    timeout: Duration,
) -> Result<RepairReport, FarmError> {
    match tokio::time::timeout(timeout, reconcile(replicas, pairs)).await {
        Ok(result) => result,
        Err(_) => Err(FarmError::RepairTimeout),
    }
}

async fn reconcile(
    replicas: &[Arc<dyn Replica>],
    pairs: &[KeyField],
) -> Result<RepairReport, FarmError> {
    let pairs: Vec<KeyField> = pairs.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    let mut report = RepairReport {
        checked: pairs.len(),
        corrected: 0,
    };
    if pairs.is_empty() || replicas.is_empty() {
        return Ok(report);
    }

    let answers = futures::future::join_all(replicas.iter().map(|r| r.score(&pairs))).await;
    let mut problems = Vec::new();
    let mut views: Vec<(usize, HashMap<KeyField, Presence>)> = Vec::new();
    for (idx, answer) in answers.into_iter().enumerate() {
        match answer {
            Ok(scores) => views.push((idx, scores)),
            Err(e) => problems.push(format!("{}: score failed: {e}", replicas[idx].name())),
        }
    }

    let now = now_ms();
    let mut plan: BTreeMap<Correction, Vec<(KeyField, f64)>> = BTreeMap::new();
    // Replica holding each inserted winner, to copy the value from.
    let mut donors: HashMap<KeyField, usize> = HashMap::new();

    for kf in &pairs {
        let held: Vec<(usize, Presence)> = views
            .iter()
            .map(|(idx, scores)| (*idx, scores.get(kf).copied().unwrap_or(Presence::ABSENT)))
            .collect();
        let winner = winning_presence(held.iter().map(|(_, p)| p));
        if !winner.present || winner.is_expired(now) {
            continue;
        }
        let mut stale = held.iter().filter(|(_, p)| !p.agrees_with(&winner)).peekable();
        if stale.peek().is_none() {
            continue;
        }
        for (idx, _) in stale {
            let correction = Correction {
                replica: *idx,
                insert: winner.inserted,
                expires_at: winner.expires_at,
            };
            plan.entry(correction).or_default().push((kf.clone(), winner.score));
        }
        if winner.inserted {
            if let Some((idx, _)) = held.iter().find(|(_, p)| p.agrees_with(&winner)) {
                donors.insert(kf.clone(), *idx);
            }
        }
    }
    if plan.is_empty() {
        return finish(report, problems);
    }

    let values = fetch_values(replicas, &donors, &mut problems).await;

    let mut writes = FuturesUnordered::new();
    for (correction, targets) in plan {
        let entries: Vec<Entry> = if correction.insert {
            targets
                .iter()
                .filter_map(|(kf, _)| values.get(kf).cloned())
                .collect()
        } else {
            targets
                .iter()
                .map(|(kf, score)| Entry::tombstone(kf.key.clone(), kf.field.clone(), *score))
                .collect()
        };
        if entries.is_empty() {
            continue;
        }
        let remaining = if correction.expires_at == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(correction.expires_at.saturating_sub(now).max(1))
        };
        let limits = Arc::new(Limits::new(SizeExpiry::new(u64::MAX, remaining)));
        let buckets = Arc::new(bucket_by_key(entries));
        let replica = replicas[correction.replica].clone();
        writes.push(async move {
            let outcomes: Vec<Outcome> = if correction.insert {
                replica.insert(buckets, limits).collect().await
            } else {
                replica.delete(buckets, limits).collect().await
            };
            (correction.replica, outcomes)
        });
    }

    while let Some((idx, outcomes)) = writes.next().await {
        for outcome in outcomes {
            match outcome.result {
                Ok(n) => report.corrected += n,
                Err(e) => problems.push(format!(
                    "{}: correcting {}: {e}",
                    replicas[idx].name(),
                    outcome.key
                )),
            }
        }
    }
    finish(report, problems)
}

/// Read the winning values from their donors, one call per (donor, key).
async fn fetch_values(
    replicas: &[Arc<dyn Replica>],
    donors: &HashMap<KeyField, usize>,
    problems: &mut Vec<String>,
) -> HashMap<KeyField, Entry> {
    let mut wanted: BTreeMap<(usize, String), Vec<String>> = BTreeMap::new();
    for (kf, idx) in donors {
        wanted
            .entry((*idx, kf.key.clone()))
            .or_default()
            .push(kf.field.clone());
    }

    let mut reads: FuturesUnordered<_> = wanted
        .into_iter()
        .map(|((idx, key), fields)| {
            let replica = replicas[idx].clone();
            async move { (idx, replica.select(&key, &fields).await) }
        })
        .collect();

    let mut values = HashMap::new();
    while let Some((idx, result)) = reads.next().await {
        match result {
            // Entries that expired since scoring simply don't come back.
            Ok(entries) => values.extend(entries.into_iter().map(|e| (e.key_field(), e))),
            Err(e) => problems.push(format!("{}: value fetch failed: {e}", replicas[idx].name())),
        }
    }
    values
}

fn finish(report: RepairReport, problems: Vec<String>) -> Result<RepairReport, FarmError> {
    if problems.is_empty() {
        Ok(report)
    } else {
        tracing::debug!(corrected = report.corrected, "repair finished with errors");
        Err(FarmError::Repair(problems.join("; ")))
    }
}

/// Run [`repair`] on the background pool. Failures go to the pool's error
/// channel.
pub fn spawn_repair(
    pool: &TaskPool,
    metrics: &Arc<FarmMetrics>,
    farm: &str,
    replicas: ReplicaSet,
    pairs: Vec<KeyField>,
    timeout: Duration,
) {
    if pairs.is_empty() {
        return;
    }
    let metrics = metrics.clone();
    let farm = farm.to_string();
    let scheduled = {
        let metrics = metrics.clone();
        let farm = farm.clone();
        pool.spawn("repair", async move {
            match repair(&replicas, &pairs, timeout).await {
                Ok(report) => {
                    metrics.repairs_completed.with_label_values(&[farm.as_str()]).inc();
                    metrics
                        .repair_corrections
                        .with_label_values(&[farm.as_str()])
                        .inc_by(report.corrected);
                    tracing::debug!(
                        farm = %farm,
                        checked = report.checked,
                        corrected = report.corrected,
                        "repair done"
                    );
                    Ok(())
                }
                Err(e) => {
                    metrics.repair_failures.with_label_values(&[farm.as_str()]).inc();
                    Err(e)
                }
            }
        })
    };
    if scheduled {
        metrics.repairs_scheduled.with_label_values(&[farm.as_str()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{ChaosReplica, ChaosReplicaConfig};
    use crate::local::LocalReplica;
    use farm_storage::StorageEngine;

    type Node = Arc<ChaosReplica<LocalReplica>>;

    fn nodes(n: usize) -> (Vec<Node>, Vec<Arc<dyn Replica>>) {
        let nodes: Vec<Node> = (0..n)
            .map(|i| {
                Arc::new(ChaosReplica::new(
                    LocalReplica::new(format!("r{i}"), StorageEngine::in_memory(2)),
                    ChaosReplicaConfig::default(),
                ))
            })
            .collect();
        let replicas = nodes.iter().map(|n| n.clone() as Arc<dyn Replica>).collect();
        (nodes, replicas)
    }

    async fn write(r: &Node, insert: bool, entries: Vec<Entry>) {
        let buckets = Arc::new(bucket_by_key(entries));
        let limits = Arc::new(Limits::default());
        let _: Vec<Outcome> = if insert {
            r.insert(buckets, limits).collect().await
        } else {
            r.delete(buckets, limits).collect().await
        };
    }

    async fn presence(r: &Node, kf: &KeyField) -> Presence {
        r.score(std::slice::from_ref(kf)).await.unwrap()[kf]
    }

    #[tokio::test]
    async fn test_repair_copies_missing_insert() {
        let (nodes, replicas) = nodes(3);
        write(&nodes[0], true, vec![Entry::new("k", "f", 2.0, "v")]).await;
        write(&nodes[1], true, vec![Entry::new("k", "f", 1.0, "old")]).await;

        let kf = KeyField::new("k", "f");
        let report = repair(&replicas, &[kf.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report, RepairReport { checked: 1, corrected: 2 });

        for node in &nodes {
            assert_eq!(presence(node, &kf).await, Presence::inserted(2.0, 0));
            let got = node.select("k", &["f".to_string()]).await.unwrap();
            assert_eq!(got[0].value, b"v");
        }

        // Converged: a second pass changes nothing.
        let again = repair(&replicas, &[kf], Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.corrected, 0);
    }

    #[tokio::test]
    async fn test_repair_propagates_tombstone_on_tie() {
        let (nodes, replicas) = nodes(2);
        write(&nodes[0], true, vec![Entry::new("k", "f", 3.0, "v")]).await;
        write(&nodes[1], false, vec![Entry::tombstone("k", "f", 3.0)]).await;

        let kf = KeyField::new("k", "f");
        repair(&replicas, &[kf.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        for node in &nodes {
            assert_eq!(presence(node, &kf).await, Presence::deleted(3.0, 0));
        }
    }

    #[tokio::test]
    async fn test_repair_reports_unreachable_replica() {
        let (nodes, replicas) = nodes(3);
        write(&nodes[0], true, vec![Entry::new("k", "f", 1.0, "v")]).await;
        nodes[2].fail();

        let kf = KeyField::new("k", "f");
        let err = repair(&replicas, &[kf.clone()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FarmError::Repair(ref s) if s.contains("r2")));
        // The reachable replicas were still corrected.
        assert_eq!(presence(&nodes[1], &kf).await, Presence::inserted(1.0, 0));
    }

    #[tokio::test]
    async fn test_repair_times_out() {
        let (nodes, replicas) = nodes(2);
        nodes[1].set_latency(Duration::from_millis(500)).await;
        let err = repair(&replicas, &[KeyField::new("k", "f")], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, FarmError::RepairTimeout);
    }

    #[tokio::test]
    async fn test_repair_of_absent_pair_is_noop() {
        let (_nodes, replicas) = nodes(2);
        let report = repair(&replicas, &[KeyField::new("k", "f")], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.corrected, 0);
    }
}
