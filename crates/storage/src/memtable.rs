//! One in-memory shard.
//!
//! Each key holds two disjoint projections: the insert-projection and the
//! delete-projection (tombstones). A field lives in at most one of them.
//! Writes are computed as a list of [`ShardOp`]s first (`plan_*`), logged,
//! and only then applied, so that a rejected batch leaves no trace.

use crate::engine::StorageError;
use crate::record::{self, RecordError, StoredRecord};
use farm_common::{sort_by_score_desc, Entry, Presence, SizeExpiry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A single state transition of one `(key, field)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardOp {
    /// Store `record` in the insert-projection, dropping any tombstone.
    Insert {
        key: String,
        field: String,
        record: Vec<u8>,
    },
    /// Store `record` in the delete-projection, dropping any live record.
    Delete {
        key: String,
        field: String,
        record: Vec<u8>,
    },
    /// Physically remove an expired record from either projection.
    Purge { key: String, field: String },
}

impl ShardOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. } | Self::Delete { key, .. } | Self::Purge { key, .. } => key,
        }
    }

    pub fn is_purge(&self) -> bool {
        matches!(self, Self::Purge { .. })
    }
}

#[derive(Debug, Default)]
struct Projections {
    inserts: HashMap<String, Vec<u8>>,
    deletes: HashMap<String, Vec<u8>>,
}

impl Projections {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Insert,
    Delete,
}

/// In-memory shard: key -> projections.
#[derive(Debug, Default)]
pub struct Memtable {
    data: HashMap<String, Projections>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys holding at least one record in either projection.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Plan an insert of `entries` (all under `key`).
    ///
    /// An entry is applied only if it beats both the live record and the
    /// tombstone for its field; an equal-score tombstone wins. Expired
    /// records under the key are purged as part of the same plan. The
    /// resulting live cardinality must stay within `limits.size`.
    pub fn plan_insert(
        &self,
        key: &str,
        entries: &[Entry],
        limits: SizeExpiry,
        now_ms: u64,
    ) -> Result<Vec<ShardOp>, StorageError> {
        let mut ops = self.expired_purges(key, now_ms)?;
        let live: HashSet<&str> = self.fields(key, Some(now_ms))?;
        let expires_at = limits.expires_at(now_ms);
        let mut added = 0usize;

        for entry in entries {
            let (current, tombstone) = self.slots(key, &entry.field, now_ms)?;
            if current.is_some_and(|r| r.score >= entry.score)
                || tombstone.is_some_and(|r| r.score >= entry.score)
            {
                continue;
            }
            if !live.contains(entry.field.as_str()) {
                added += 1;
            }
            ops.push(ShardOp::Insert {
                key: key.to_string(),
                field: entry.field.clone(),
                record: record::pack(entry.score, &entry.txn, expires_at, &entry.value),
            });
        }

        let resulting = live.len() + added;
        if resulting as u64 > limits.size {
            return Err(StorageError::MaxSize {
                key: key.to_string(),
                size: resulting as u64,
                max: limits.size,
            });
        }
        Ok(ops)
    }

    /// Plan a delete of `entries` (all under `key`). A tombstone replaces a
    /// live record whose score is lower than or equal to its own.
    pub fn plan_delete(
        &self,
        key: &str,
        entries: &[Entry],
        limits: SizeExpiry,
        now_ms: u64,
    ) -> Result<Vec<ShardOp>, StorageError> {
        let mut ops = self.expired_purges(key, now_ms)?;
        let expires_at = limits.expires_at(now_ms);

        for entry in entries {
            let (current, tombstone) = self.slots(key, &entry.field, now_ms)?;
            if tombstone.is_some_and(|r| r.score >= entry.score)
                || current.is_some_and(|r| r.score > entry.score)
            {
                continue;
            }
            ops.push(ShardOp::Delete {
                key: key.to_string(),
                field: entry.field.clone(),
                record: record::pack(entry.score, &entry.txn, expires_at, &[]),
            });
        }
        Ok(ops)
    }

    /// Apply one planned (or replayed) op.
    pub fn apply(&mut self, op: ShardOp) {
        match op {
            ShardOp::Insert { key, field, record } => {
                let p = self.data.entry(key).or_default();
                p.deletes.remove(&field);
                p.inserts.insert(field, record);
            }
            ShardOp::Delete { key, field, record } => {
                let p = self.data.entry(key).or_default();
                p.inserts.remove(&field);
                p.deletes.insert(field, record);
            }
            ShardOp::Purge { key, field } => {
                if let Some(p) = self.data.get_mut(&key) {
                    p.inserts.remove(&field);
                    p.deletes.remove(&field);
                    if p.is_empty() {
                        self.data.remove(&key);
                    }
                }
            }
        }
    }

    /// Raw presence of a field, expired records included.
    pub fn presence(&self, key: &str, field: &str) -> Result<Presence, RecordError> {
        let Some(p) = self.data.get(key) else {
            return Ok(Presence::ABSENT);
        };
        if let Some(raw) = p.inserts.get(field) {
            let rec = record::unpack(raw)?;
            return Ok(Presence::inserted(rec.score, rec.expires_at));
        }
        if let Some(raw) = p.deletes.get(field) {
            let rec = record::unpack(raw)?;
            return Ok(Presence::deleted(rec.score, rec.expires_at));
        }
        Ok(Presence::ABSENT)
    }

    /// Live entries for the requested fields; missing or expired fields are skipped.
    pub fn select(&self, key: &str, fields: &[String], now_ms: u64) -> Result<Vec<Entry>, RecordError> {
        let Some(p) = self.data.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for field in fields {
            if let Some(raw) = p.inserts.get(field) {
                let rec = record::unpack(raw)?;
                if !rec.is_expired(now_ms) {
                    out.push(to_entry(key, field, rec));
                }
            }
        }
        Ok(out)
    }

    /// Live entries under `key`, highest score first (field ascending on
    /// ties), windowed by `offset` and `limit`.
    pub fn range(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
        now_ms: u64,
    ) -> Result<Vec<Entry>, RecordError> {
        let Some(p) = self.data.get(key) else {
            return Ok(Vec::new());
        };
        let mut live = Vec::with_capacity(p.inserts.len());
        for (field, raw) in &p.inserts {
            let rec = record::unpack(raw)?;
            if !rec.is_expired(now_ms) {
                live.push(to_entry(key, field, rec));
            }
        }
        sort_by_score_desc(&mut live);
        Ok(live.into_iter().skip(offset).take(limit).collect())
    }

    /// Keys with at least one field in the insert-projection. With
    /// `live_at`, fields expired at that instant do not count.
    pub fn keys(&self, live_at: Option<u64>) -> Result<Vec<String>, RecordError> {
        let mut keys = Vec::new();
        for key in self.data.keys() {
            if !self.fields(key, live_at)?.is_empty() {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }

    /// Fields in the insert-projection of `key`, filtered like [`Memtable::keys`].
    pub fn members(&self, key: &str, live_at: Option<u64>) -> Result<Vec<String>, RecordError> {
        Ok(self
            .fields(key, live_at)?
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Purges for every expired record in the shard, either projection.
    pub fn plan_purge(&self, now_ms: u64) -> Result<Vec<ShardOp>, RecordError> {
        let mut ops = Vec::new();
        for key in self.data.keys() {
            ops.extend(self.expired_purges(key, now_ms)?);
        }
        Ok(ops)
    }

    /// Every stored record as the op that recreates it.
    pub fn snapshot(&self) -> Vec<ShardOp> {
        let mut ops = Vec::new();
        for (key, p) in &self.data {
            for (field, record) in &p.inserts {
                ops.push(ShardOp::Insert {
                    key: key.clone(),
                    field: field.clone(),
                    record: record.clone(),
                });
            }
            for (field, record) in &p.deletes {
                ops.push(ShardOp::Delete {
                    key: key.clone(),
                    field: field.clone(),
                    record: record.clone(),
                });
            }
        }
        ops
    }

    fn fields(&self, key: &str, live_at: Option<u64>) -> Result<HashSet<&str>, RecordError> {
        let mut out = HashSet::new();
        if let Some(p) = self.data.get(key) {
            for (field, raw) in &p.inserts {
                let expired = match live_at {
                    Some(now_ms) => record::unpack(raw)?.is_expired(now_ms),
                    None => false,
                };
                if !expired {
                    out.insert(field.as_str());
                }
            }
        }
        Ok(out)
    }

    /// Current unexpired (insert, tombstone) records of a field.
    fn slots(
        &self,
        key: &str,
        field: &str,
        now_ms: u64,
    ) -> Result<(Option<StoredRecord>, Option<StoredRecord>), RecordError> {
        let Some(p) = self.data.get(key) else {
            return Ok((None, None));
        };
        let read = |side: Side| -> Result<Option<StoredRecord>, RecordError> {
            let map = match side {
                Side::Insert => &p.inserts,
                Side::Delete => &p.deletes,
            };
            match map.get(field) {
                Some(raw) => {
                    let rec = record::unpack(raw)?;
                    Ok((!rec.is_expired(now_ms)).then_some(rec))
                }
                None => Ok(None),
            }
        };
        Ok((read(Side::Insert)?, read(Side::Delete)?))
    }

    fn expired_purges(&self, key: &str, now_ms: u64) -> Result<Vec<ShardOp>, RecordError> {
        let mut ops = Vec::new();
        if let Some(p) = self.data.get(key) {
            for (field, raw) in p.inserts.iter().chain(p.deletes.iter()) {
                if record::unpack(raw)?.is_expired(now_ms) {
                    ops.push(ShardOp::Purge {
                        key: key.to_string(),
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(ops)
    }
}

fn to_entry(key: &str, field: &str, rec: StoredRecord) -> Entry {
    Entry {
        key: key.to_string(),
        field: field.to_string(),
        score: rec.score,
        txn: rec.txn,
        value: rec.value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: u64 = 1_000_000;

    fn apply_all(mt: &mut Memtable, ops: Vec<ShardOp>) -> usize {
        let changed = ops.iter().filter(|op| !op.is_purge()).count();
        for op in ops {
            mt.apply(op);
        }
        changed
    }

    fn insert(mt: &mut Memtable, field: &str, score: f64, value: &str) -> usize {
        let ops = mt
            .plan_insert("k", &[Entry::new("k", field, score, value)], SizeExpiry::unbounded(), NOW)
            .unwrap();
        apply_all(mt, ops)
    }

    fn delete(mt: &mut Memtable, field: &str, score: f64) -> usize {
        let ops = mt
            .plan_delete("k", &[Entry::tombstone("k", field, score)], SizeExpiry::unbounded(), NOW)
            .unwrap();
        apply_all(mt, ops)
    }

    #[test]
    fn test_insert_then_select() {
        let mut mt = Memtable::new();
        assert_eq!(insert(&mut mt, "f", 1.0, "v1"), 1);

        let got = mt.select("k", &["f".to_string()], NOW).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, b"v1");
        assert_eq!(mt.presence("k", "f").unwrap(), Presence::inserted(1.0, 0));
    }

    #[test]
    fn test_lower_or_equal_score_is_noop() {
        let mut mt = Memtable::new();
        insert(&mut mt, "f", 2.0, "v2");
        assert_eq!(insert(&mut mt, "f", 1.0, "v1"), 0);
        assert_eq!(insert(&mut mt, "f", 2.0, "again"), 0);

        let got = mt.select("k", &["f".to_string()], NOW).unwrap();
        assert_eq!(got[0].value, b"v2");
    }

    #[test]
    fn test_tombstone_exclusivity() {
        let mut mt = Memtable::new();
        insert(&mut mt, "f", 1.0, "v1");
        assert_eq!(delete(&mut mt, "f", 2.0), 1);

        assert_eq!(mt.presence("k", "f").unwrap(), Presence::deleted(2.0, 0));
        assert!(mt.select("k", &["f".to_string()], NOW).unwrap().is_empty());

        // Re-insert above the tombstone swaps it back.
        assert_eq!(insert(&mut mt, "f", 3.0, "v3"), 1);
        assert_eq!(mt.presence("k", "f").unwrap(), Presence::inserted(3.0, 0));
        let p = &mt.data["k"];
        assert!(p.deletes.is_empty());
        assert_eq!(p.inserts.len(), 1);
    }

    #[test]
    fn test_tombstone_wins_tie() {
        let mut mt = Memtable::new();
        insert(&mut mt, "f", 5.0, "v");
        assert_eq!(delete(&mut mt, "f", 5.0), 1);
        assert_eq!(insert(&mut mt, "f", 5.0, "v"), 0);
        assert!(!mt.presence("k", "f").unwrap().inserted);
    }

    #[test]
    fn test_stale_delete_ignored() {
        let mut mt = Memtable::new();
        insert(&mut mt, "f", 5.0, "v");
        assert_eq!(delete(&mut mt, "f", 4.0), 0);
        assert!(mt.presence("k", "f").unwrap().inserted);
    }

    #[test]
    fn test_cardinality_ceiling() {
        let mut mt = Memtable::new();
        let limits = SizeExpiry::new(2, Duration::ZERO);
        let ops = mt
            .plan_insert(
                "k",
                &[Entry::new("k", "a", 1.0, "x"), Entry::new("k", "b", 1.0, "y")],
                limits,
                NOW,
            )
            .unwrap();
        apply_all(&mut mt, ops);

        // Updating an existing field does not grow the key.
        assert!(mt
            .plan_insert("k", &[Entry::new("k", "a", 2.0, "x2")], limits, NOW)
            .is_ok());

        let err = mt
            .plan_insert("k", &[Entry::new("k", "c", 1.0, "z")], limits, NOW)
            .unwrap_err();
        assert!(matches!(err, StorageError::MaxSize { size: 3, max: 2, .. }));
    }

    #[test]
    fn test_expired_records_are_hidden_and_purged() {
        let mut mt = Memtable::new();
        let limits = SizeExpiry::new(u64::MAX, Duration::from_millis(100));
        let ops = mt
            .plan_insert("k", &[Entry::new("k", "f", 1.0, "v")], limits, NOW)
            .unwrap();
        apply_all(&mut mt, ops);

        let later = NOW + 100;
        assert!(mt.select("k", &["f".to_string()], later).unwrap().is_empty());
        assert!(mt.keys(Some(later)).unwrap().is_empty());
        // Presence and unfiltered enumeration are raw: still physically stored.
        assert!(mt.presence("k", "f").unwrap().present);
        assert_eq!(mt.members("k", None).unwrap(), vec!["f".to_string()]);

        // The next write to the key purges it, and a lower score now wins.
        let ops = mt
            .plan_insert("k", &[Entry::new("k", "g", 0.5, "w")], SizeExpiry::unbounded(), later)
            .unwrap();
        assert!(ops.iter().any(ShardOp::is_purge));
        apply_all(&mut mt, ops);
        assert!(!mt.presence("k", "f").unwrap().present);
        assert_eq!(mt.members("k", Some(later)).unwrap(), vec!["g".to_string()]);
    }

    #[test]
    fn test_range_orders_by_score() {
        let mut mt = Memtable::new();
        insert(&mut mt, "low", 1.0, "l");
        insert(&mut mt, "high", 3.0, "h");
        insert(&mut mt, "mid-b", 2.0, "m");
        insert(&mut mt, "mid-a", 2.0, "m");

        let fields: Vec<String> = mt
            .range("k", 0, 10, NOW)
            .unwrap()
            .into_iter()
            .map(|e| e.field)
            .collect();
        assert_eq!(fields, vec!["high", "mid-a", "mid-b", "low"]);

        let page = mt.range("k", 1, 2, NOW).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].field, "mid-a");
    }

    #[test]
    fn test_plan_purge_reclaims_expired_tombstones() {
        let mut mt = Memtable::new();
        let short = SizeExpiry::new(u64::MAX, Duration::from_millis(10));
        let ops = mt
            .plan_delete("k", &[Entry::tombstone("k", "gone", 2.0)], short, NOW)
            .unwrap();
        apply_all(&mut mt, ops);
        insert(&mut mt, "kept", 1.0, "v");

        assert!(mt.plan_purge(NOW + 5).unwrap().is_empty());
        let ops = mt.plan_purge(NOW + 10).unwrap();
        assert_eq!(
            ops,
            vec![ShardOp::Purge {
                key: "k".into(),
                field: "gone".into()
            }]
        );
        apply_all(&mut mt, ops);
        assert!(!mt.presence("k", "gone").unwrap().present);
        assert_eq!(mt.snapshot().len(), 1);
    }

    #[test]
    fn test_purge_drops_empty_key() {
        let mut mt = Memtable::new();
        insert(&mut mt, "f", 1.0, "v");
        mt.apply(ShardOp::Purge {
            key: "k".into(),
            field: "f".into(),
        });
        assert!(mt.is_empty());
    }
}
