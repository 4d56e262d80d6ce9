//! Storage engine: key-sharded memtables behind an optional WAL.
//!
//! Every write for one key is planned against its shard, appended to the
//! WAL, and only then applied, so the tombstone swap and the cardinality
//! check are atomic per key.

use crate::memtable::{Memtable, ShardOp};
use crate::record::RecordError;
use crate::wal::{FsyncPolicy, Wal, WalError};
use farm_common::{Entry, Presence, SizeExpiry};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Record(#[from] RecordError),
    #[error("key {key:?} would hold {size} fields, max {max}")]
    MaxSize { key: String, size: u64, max: u64 },
}

/// The storage engine. All operations are synchronous; the async boundary
/// is at the caller (the replica adapter).
#[derive(Debug)]
pub struct StorageEngine {
    shards: Vec<Memtable>,
    wal: Option<Wal>,
    wal_path: Option<PathBuf>,
    fsync: FsyncPolicy,
}

impl StorageEngine {
    /// An engine with no durability.
    pub fn in_memory(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Memtable::new()).collect(),
            wal: None,
            wal_path: None,
            fsync: FsyncPolicy::None,
        }
    }

    /// Open or create a WAL-backed engine in `data_dir`.
    pub fn open(data_dir: &Path, shards: usize, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let mut engine = Self::in_memory(shards);
        let ops = Wal::replay(&wal_path)?;
        let replayed = ops.len();
        for op in ops {
            let shard = engine.shard_for(op.key());
            engine.shards[shard].apply(op);
        }
        engine.wal = Some(Wal::open(&wal_path, fsync)?);
        engine.fsync = fsync;
        engine.wal_path = Some(wal_path.clone());

        tracing::info!(
            "storage engine opened: {} ops replayed, {} keys across {} shards at {:?}",
            replayed,
            engine.key_count(),
            engine.shards.len(),
            wal_path
        );
        Ok(engine)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a key (SHA-1 of the key, first 8 bytes).
    pub fn shard_for(&self, key: &str) -> usize {
        let hash = Sha1::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        (u64::from_be_bytes(prefix) % self.shards.len() as u64) as usize
    }

    /// Insert entries under one key. Returns how many fields changed.
    pub fn insert(
        &mut self,
        key: &str,
        entries: &[Entry],
        limits: SizeExpiry,
        now_ms: u64,
    ) -> Result<u64, StorageError> {
        let shard = self.shard_for(key);
        let ops = self.shards[shard].plan_insert(key, entries, limits, now_ms)?;
        self.commit(shard, ops)
    }

    /// Write tombstones for entries under one key. Returns how many fields changed.
    pub fn delete(
        &mut self,
        key: &str,
        entries: &[Entry],
        limits: SizeExpiry,
        now_ms: u64,
    ) -> Result<u64, StorageError> {
        let shard = self.shard_for(key);
        let ops = self.shards[shard].plan_delete(key, entries, limits, now_ms)?;
        self.commit(shard, ops)
    }

    /// Physically remove every record expired at `now_ms`, tombstones
    /// included, and compact the WAL if anything went. Returns how many
    /// records were removed.
    pub fn purge_expired(&mut self, now_ms: u64) -> Result<u64, StorageError> {
        let mut purged = 0u64;
        for shard in 0..self.shards.len() {
            let ops = self.shards[shard].plan_purge(now_ms)?;
            purged += ops.len() as u64;
            self.commit(shard, ops)?;
        }
        if purged > 0 {
            self.compact()?;
        }
        Ok(purged)
    }

    /// Rewrite the WAL as one op per stored record.
    pub fn compact(&mut self) -> Result<(), StorageError> {
        let Some(path) = self.wal_path.as_deref() else {
            return Ok(());
        };
        let ops: Vec<ShardOp> = self.shards.iter().flat_map(Memtable::snapshot).collect();
        let wal = Wal::rewrite(path, &ops, self.fsync)?;
        tracing::debug!("WAL compacted to {} ops at {:?}", ops.len(), path);
        self.wal = Some(wal);
        Ok(())
    }

    fn commit(&mut self, shard: usize, ops: Vec<ShardOp>) -> Result<u64, StorageError> {
        if ops.is_empty() {
            return Ok(0);
        }
        if let Some(wal) = self.wal.as_mut() {
            wal.append_all(&ops)?;
        }
        let changed = ops.iter().filter(|op| !op.is_purge()).count() as u64;
        for op in ops {
            self.shards[shard].apply(op);
        }
        Ok(changed)
    }

    pub fn presence(&self, key: &str, field: &str) -> Result<Presence, StorageError> {
        Ok(self.shards[self.shard_for(key)].presence(key, field)?)
    }

    pub fn select(&self, key: &str, fields: &[String], now_ms: u64) -> Result<Vec<Entry>, StorageError> {
        Ok(self.shards[self.shard_for(key)].select(key, fields, now_ms)?)
    }

    pub fn range(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
        now_ms: u64,
    ) -> Result<Vec<Entry>, StorageError> {
        Ok(self.shards[self.shard_for(key)].range(key, offset, limit, now_ms)?)
    }

    /// Keys holding at least one inserted field, sorted. With `live_at`,
    /// only fields unexpired at that instant count; without it, expired but
    /// not yet purged fields are included.
    pub fn keys(&self, live_at: Option<u64>) -> Result<Vec<String>, StorageError> {
        let mut keys = BTreeSet::new();
        for shard in &self.shards {
            keys.extend(shard.keys(live_at)?);
        }
        Ok(keys.into_iter().collect())
    }

    /// Inserted fields under a key, sorted; `live_at` as for [`StorageEngine::keys`].
    pub fn members(&self, key: &str, live_at: Option<u64>) -> Result<Vec<String>, StorageError> {
        let mut members = self.shards[self.shard_for(key)].members(key, live_at)?;
        members.sort();
        Ok(members)
    }

    /// Live cardinality of a key.
    pub fn size(&self, key: &str, now_ms: u64) -> Result<u64, StorageError> {
        Ok(self.shards[self.shard_for(key)]
            .members(key, Some(now_ms))?
            .len() as u64)
    }

    /// Keys physically stored (live or not) across all shards.
    pub fn key_count(&self) -> usize {
        self.shards.iter().map(Memtable::len).sum()
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StorageError> {
        if let Some(wal) = self.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const NOW: u64 = 5_000;

    fn put(engine: &mut StorageEngine, key: &str, field: &str, score: f64, value: &str) -> u64 {
        engine
            .insert(key, &[Entry::new(key, field, score, value)], SizeExpiry::unbounded(), NOW)
            .unwrap()
    }

    #[test]
    fn test_engine_insert_select() {
        let mut engine = StorageEngine::in_memory(4);
        assert_eq!(put(&mut engine, "k1", "f", 1.0, "v1"), 1);

        let got = engine.select("k1", &["f".to_string()], NOW).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, b"v1");
    }

    #[test]
    fn test_shard_routing_is_stable() {
        let engine = StorageEngine::in_memory(8);
        for key in ["a", "b", "user:42", ""] {
            let s = engine.shard_for(key);
            assert!(s < 8);
            assert_eq!(s, engine.shard_for(key));
        }
        assert_eq!(StorageEngine::in_memory(0).shard_count(), 1);
    }

    #[test]
    fn test_keys_span_shards() {
        let mut engine = StorageEngine::in_memory(4);
        for i in 0..20 {
            put(&mut engine, &format!("key-{i:02}"), "f", 1.0, "v");
        }
        let keys = engine.keys(Some(NOW)).unwrap();
        assert_eq!(keys.len(), 20);
        assert_eq!(keys[0], "key-00");
        assert_eq!(keys[19], "key-19");
    }

    #[test]
    fn test_max_size_rejects_whole_batch() {
        let mut engine = StorageEngine::in_memory(2);
        let limits = SizeExpiry::new(1, Duration::ZERO);
        let batch = [Entry::new("k", "a", 1.0, "x"), Entry::new("k", "b", 1.0, "y")];
        let err = engine.insert("k", &batch, limits, NOW).unwrap_err();
        assert!(matches!(err, StorageError::MaxSize { size: 2, max: 1, .. }));
        assert_eq!(engine.size("k", NOW).unwrap(), 0);
    }

    #[test]
    fn test_delete_and_members() {
        let mut engine = StorageEngine::in_memory(2);
        put(&mut engine, "k", "a", 1.0, "x");
        put(&mut engine, "k", "b", 1.0, "y");
        let changed = engine
            .delete("k", &[Entry::tombstone("k", "a", 2.0)], SizeExpiry::unbounded(), NOW)
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(engine.members("k", Some(NOW)).unwrap(), vec!["b".to_string()]);
        assert_eq!(engine.presence("k", "a").unwrap(), Presence::deleted(2.0, 0));
    }

    #[test]
    fn test_engine_crash_recovery() {
        let dir = TempDir::new().unwrap();

        {
            let mut engine = StorageEngine::open(dir.path(), 4, FsyncPolicy::Always).unwrap();
            put(&mut engine, "k1", "f", 1.0, "v1");
            put(&mut engine, "k2", "f", 1.0, "v2");
            put(&mut engine, "k1", "f", 2.0, "v1b");
            engine
                .delete("k2", &[Entry::tombstone("k2", "f", 3.0)], SizeExpiry::unbounded(), NOW)
                .unwrap();
        }

        {
            let engine = StorageEngine::open(dir.path(), 4, FsyncPolicy::Always).unwrap();
            let got = engine.select("k1", &["f".to_string()], NOW).unwrap();
            assert_eq!(got[0].value, b"v1b");
            assert_eq!(got[0].score, 2.0);
            assert_eq!(engine.presence("k2", "f").unwrap(), Presence::deleted(3.0, 0));
            assert_eq!(engine.keys(None).unwrap(), vec!["k1".to_string()]);
        }
    }

    #[test]
    fn test_purge_expired_reclaims_tombstones_and_compacts() {
        let dir = TempDir::new().unwrap();
        let short = SizeExpiry::new(u64::MAX, Duration::from_millis(10));
        {
            let mut engine = StorageEngine::open(dir.path(), 2, FsyncPolicy::None).unwrap();
            put(&mut engine, "kept", "f", 1.0, "v");
            engine
                .delete("gone", &[Entry::tombstone("gone", "f", 2.0)], short, NOW)
                .unwrap();
            assert_eq!(engine.key_count(), 2);

            assert_eq!(engine.purge_expired(NOW + 5).unwrap(), 0);
            assert_eq!(engine.purge_expired(NOW + 10).unwrap(), 1);
            assert_eq!(engine.key_count(), 1);
        }

        // Only the surviving record is left in the log.
        assert_eq!(Wal::replay(&dir.path().join("wal.log")).unwrap().len(), 1);
        let engine = StorageEngine::open(dir.path(), 2, FsyncPolicy::None).unwrap();
        assert_eq!(engine.key_count(), 1);
        assert_eq!(engine.presence("gone", "f").unwrap(), Presence::ABSENT);
    }

    #[test]
    fn test_rejected_batch_not_logged() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = StorageEngine::open(dir.path(), 1, FsyncPolicy::None).unwrap();
            let limits = SizeExpiry::new(0, Duration::ZERO);
            assert!(engine
                .insert("k", &[Entry::new("k", "a", 1.0, "x")], limits, NOW)
                .is_err());
        }
        let engine = StorageEngine::open(dir.path(), 1, FsyncPolicy::None).unwrap();
        assert_eq!(engine.key_count(), 0);
    }
}
