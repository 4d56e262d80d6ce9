//! Write-Ahead Log (WAL) for durability.
//!
//! Format: each entry is `[4-byte CRC32][4-byte length][JSON ShardOp]\n`.
//! On recovery, replay all valid entries. Corrupt tail entries are truncated.

use crate::memtable::ShardOp;
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// An append-only write-ahead log of shard ops.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            fsync,
            entries_written: 0,
        })
    }

    /// Append a batch of ops, flushing once at the end.
    pub fn append_all(&mut self, ops: &[ShardOp]) -> Result<(), WalError> {
        for op in ops {
            let payload = serde_json::to_vec(op)?;

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let crc = hasher.finalize();

            // CRC(4) + LEN(4) + PAYLOAD + \n
            self.writer.write_all(&crc.to_le_bytes())?;
            self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            self.writer.write_all(&payload)?;
            self.writer.write_all(b"\n")?;
            self.entries_written += 1;
        }
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries written since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replace the log at `path` with exactly `ops` and reopen it for
    /// appending. The new log is written beside the old one and renamed over
    /// it, so a crash leaves one of the two intact.
    pub fn rewrite(path: &Path, ops: &[ShardOp], fsync: FsyncPolicy) -> Result<Self, WalError> {
        let tmp = path.with_extension("compact");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut wal = Self {
                writer: BufWriter::new(file),
                fsync: FsyncPolicy::None,
                entries_written: 0,
            };
            wal.append_all(ops)?;
            wal.sync()?;
        }
        std::fs::rename(&tmp, path)?;
        Self::open(path, fsync)
    }

    /// Replay all valid ops from a WAL file, in order. Stops at the first
    /// torn or corrupt entry.
    pub fn replay(path: &Path) -> Result<Vec<ShardOp>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut ops = Vec::new();

        loop {
            let mut crc_buf = [0u8; 4];
            match io::Read::read_exact(&mut reader, &mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // clean EOF
                Err(e) => return Err(WalError::Io(e)),
            }
            let expected_crc = u32::from_le_bytes(crc_buf);

            // Treat UnexpectedEof as a torn entry (stop replay).
            macro_rules! read_or_break {
                ($reader:expr, $buf:expr) => {
                    match io::Read::read_exact($reader, $buf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            tracing::warn!(
                                "WAL truncated mid-entry at entry {}; stopping replay",
                                ops.len()
                            );
                            break;
                        }
                        Err(e) => return Err(WalError::Io(e)),
                    }
                };
            }

            let mut len_buf = [0u8; 4];
            read_or_break!(&mut reader, &mut len_buf);
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            read_or_break!(&mut reader, &mut payload);

            let mut nl = [0u8; 1];
            read_or_break!(&mut reader, &mut nl);

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let actual_crc = hasher.finalize();

            if actual_crc != expected_crc {
                tracing::warn!(
                    "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}; stopping replay",
                    ops.len(),
                    expected_crc,
                    actual_crc
                );
                break;
            }

            ops.push(serde_json::from_slice(&payload)?);
        }

        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn insert_op(key: &str, field: &str) -> ShardOp {
        ShardOp::Insert {
            key: key.to_string(),
            field: field.to_string(),
            record: format!("{key}/{field}").into_bytes(),
        }
    }

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append_all(&[insert_op("k1", "a"), insert_op("k2", "b")])
                .unwrap();
            wal.append_all(&[ShardOp::Purge {
                key: "k1".into(),
                field: "a".into(),
            }])
            .unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let ops = Wal::replay(&wal_path).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], insert_op("k1", "a"));
        assert_eq!(ops[1].key(), "k2");
        assert!(ops[2].is_purge());
    }

    #[test]
    fn test_wal_rewrite_replaces_history() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();
            wal.append_all(&[insert_op("k1", "a"), insert_op("k2", "b")])
                .unwrap();
        }

        let mut wal = Wal::rewrite(&wal_path, &[insert_op("k2", "b")], FsyncPolicy::None).unwrap();
        wal.append_all(&[insert_op("k3", "c")]).unwrap();
        drop(wal);

        let ops = Wal::replay(&wal_path).unwrap();
        assert_eq!(ops, vec![insert_op("k2", "b"), insert_op("k3", "c")]);
        assert!(!wal_path.with_extension("compact").exists());
    }

    #[test]
    fn test_wal_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        let ops = Wal::replay(&dir.path().join("empty.wal")).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_wal_replay_truncated() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append_all(&[insert_op("k1", "a"), insert_op("k2", "b"), insert_op("k3", "c")])
                .unwrap();
        }

        // Chop off the end of the last entry.
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        let ops = Wal::replay(&wal_path).unwrap();
        assert_eq!(ops.len(), 2, "should recover 2 of 3 entries after truncation");
        assert_eq!(ops[1].key(), "k2");
    }

    #[test]
    fn test_wal_crc_mismatch_stops_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("crc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();
            wal.append_all(&[insert_op("k1", "a"), insert_op("k2", "b")])
                .unwrap();
        }

        // Flip one payload byte of the second entry.
        let mut bytes = std::fs::read(&wal_path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xff;
        std::fs::write(&wal_path, bytes).unwrap();

        let ops = Wal::replay(&wal_path).unwrap();
        assert_eq!(ops.len(), 1);
    }
}
