//! farm-common: shared data model for the replicated key/value farm.
//!
//! Provides the [`Entry`] value, the [`Presence`] answer a replica gives for
//! one `(key, field)`, the per-key [`SizeExpiry`] write limits, and the
//! routing helper that buckets a batch of entries by key.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// Opaque write-correlation identifier. Never participates in ordering.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Txn(String);

impl Txn {
    /// Generate a fresh random transaction id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Txn {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Txn {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txn({})", self.0)
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Entry / KeyField
// ---------------------------------------------------------------------------

/// One field under a key, with its ordering score and opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Groups related fields; the unit of sharding.
    pub key: String,
    /// Identifies an item within the key.
    pub field: String,
    /// Caller-supplied ordering value. Highest score wins.
    pub score: f64,
    pub txn: Txn,
    pub value: Vec<u8>,
}

impl Entry {
    /// Create an entry with a random transaction id.
    pub fn new(
        key: impl Into<String>,
        field: impl Into<String>,
        score: f64,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            score,
            txn: Txn::random(),
            value: value.into(),
        }
    }

    /// An entry used only to address a delete; carries no payload.
    pub fn tombstone(key: impl Into<String>, field: impl Into<String>, score: f64) -> Self {
        Self::new(key, field, score, Vec::new())
    }

    pub fn with_txn(mut self, txn: impl Into<Txn>) -> Self {
        self.txn = txn.into();
        self
    }

    pub fn key_field(&self) -> KeyField {
        KeyField::new(self.key.clone(), self.field.clone())
    }
}

/// Address of one logical entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyField {
    pub key: String,
    pub field: String,
}

impl KeyField {
    pub fn new(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key, self.field)
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// What one replica physically stores for a `(key, field)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Presence {
    pub present: bool,
    /// `true` if the record lives in the insert-projection, `false` for a tombstone.
    pub inserted: bool,
    pub score: f64,
    /// Absolute expiry in unix millis; 0 = never.
    pub expires_at: u64,
}

impl Presence {
    pub const ABSENT: Self = Self {
        present: false,
        inserted: false,
        score: 0.0,
        expires_at: 0,
    };

    pub fn inserted(score: f64, expires_at: u64) -> Self {
        Self {
            present: true,
            inserted: true,
            score,
            expires_at,
        }
    }

    pub fn deleted(score: f64, expires_at: u64) -> Self {
        Self {
            present: true,
            inserted: false,
            score,
            expires_at,
        }
    }

    /// Whether the stored record's expiry has passed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.present && self.expires_at != 0 && self.expires_at <= now_ms
    }

    /// Whether this record beats `other` under last-write-wins.
    ///
    /// Absent never wins; on an exact score tie a tombstone beats an insert.
    pub fn wins_over(&self, other: &Presence) -> bool {
        if !self.present {
            return false;
        }
        if !other.present {
            return true;
        }
        if self.score > other.score {
            return true;
        }
        self.score == other.score && !self.inserted && other.inserted
    }

    /// Whether two replicas hold the same logical record.
    pub fn agrees_with(&self, other: &Presence) -> bool {
        match (self.present, other.present) {
            (false, false) => true,
            (true, true) => self.inserted == other.inserted && self.score == other.score,
            _ => false,
        }
    }
}

/// Pick the winning record from a set of presences (absent if none present).
pub fn winning_presence<'a>(presences: impl IntoIterator<Item = &'a Presence>) -> Presence {
    presences
        .into_iter()
        .fold(Presence::ABSENT, |best, p| if p.wins_over(&best) { *p } else { best })
}

// ---------------------------------------------------------------------------
// SizeExpiry / Limits
// ---------------------------------------------------------------------------

/// Per-key write limits: cardinality ceiling and time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeExpiry {
    /// Maximum number of live fields under the key.
    pub size: u64,
    /// Time-to-live of written records; zero means never expire.
    pub expiry: Duration,
}

impl SizeExpiry {
    pub fn new(size: u64, expiry: Duration) -> Self {
        Self { size, expiry }
    }

    /// No ceiling and no expiry.
    pub fn unbounded() -> Self {
        Self {
            size: u64::MAX,
            expiry: Duration::ZERO,
        }
    }

    /// Absolute expiry for a record written at `now_ms` (0 = never).
    pub fn expires_at(&self, now_ms: u64) -> u64 {
        if self.expiry.is_zero() {
            0
        } else {
            now_ms.saturating_add(self.expiry.as_millis() as u64)
        }
    }
}

impl Default for SizeExpiry {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Default [`SizeExpiry`] plus per-key overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub default: SizeExpiry,
    #[serde(default)]
    pub per_key: HashMap<String, SizeExpiry>,
}

impl Limits {
    pub fn new(default: SizeExpiry) -> Self {
        Self {
            default,
            per_key: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>, limits: SizeExpiry) -> Self {
        self.per_key.insert(key.into(), limits);
        self
    }

    pub fn for_key(&self, key: &str) -> SizeExpiry {
        self.per_key.get(key).copied().unwrap_or(self.default)
    }
}

// ---------------------------------------------------------------------------
// Routing helpers
// ---------------------------------------------------------------------------

/// Group entries by key. Within a key, duplicate fields collapse to the one
/// with the highest score (first wins on equal scores).
pub fn bucket_by_key(entries: impl IntoIterator<Item = Entry>) -> BTreeMap<String, Vec<Entry>> {
    let mut buckets: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
    for entry in entries {
        let bucket = buckets.entry(entry.key.clone()).or_default();
        match bucket.iter_mut().find(|e| e.field == entry.field) {
            Some(existing) if entry.score > existing.score => *existing = entry,
            Some(_) => {}
            None => bucket.push(entry),
        }
    }
    buckets
}

/// Order entries highest score first, field ascending on equal scores.
pub fn sort_by_score_desc(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.field.cmp(&b.field))
    });
}

/// Wall-clock time in unix millis.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
