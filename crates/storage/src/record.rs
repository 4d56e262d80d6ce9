//! Packed record format.
//!
//! Every projection slot stores one packed byte string:
//! `<16 hex digits of the f64 bits>|<expires_at decimal>|<txn length>:<txn><value>`.
//! The score is stored as raw bits so that `unpack(pack(..))` reproduces it
//! exactly, NaN payloads and signed zero included.

use farm_common::Txn;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("packed record truncated")]
    Truncated,
    #[error("invalid score field: {0:?}")]
    Score(String),
    #[error("invalid expiry field: {0:?}")]
    Expiry(String),
    #[error("invalid txn field: {0}")]
    Txn(String),
}

/// The unpacked contents of one projection slot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub score: f64,
    pub txn: Txn,
    /// Absolute expiry in unix millis; 0 = never.
    pub expires_at: u64,
    pub value: Vec<u8>,
}

impl StoredRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now_ms
    }

    pub fn pack(&self) -> Vec<u8> {
        pack(self.score, &self.txn, self.expires_at, &self.value)
    }
}

/// Encode a record into its packed form.
pub fn pack(score: f64, txn: &Txn, expires_at: u64, value: &[u8]) -> Vec<u8> {
    let txn = txn.as_str().as_bytes();
    let header = format!("{:016x}|{}|{}:", score.to_bits(), expires_at, txn.len());
    let mut out = Vec::with_capacity(header.len() + txn.len() + value.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(txn);
    out.extend_from_slice(value);
    out
}

/// Decode a packed record.
pub fn unpack(packed: &[u8]) -> Result<StoredRecord, RecordError> {
    let (score_raw, rest) = split_at_byte(packed, b'|')?;
    let (expiry_raw, rest) = split_at_byte(rest, b'|')?;
    let (txn_len_raw, rest) = split_at_byte(rest, b':')?;

    let score_str = std::str::from_utf8(score_raw).map_err(|_| RecordError::Score(lossy(score_raw)))?;
    if score_str.len() != 16 {
        return Err(RecordError::Score(score_str.to_string()));
    }
    let bits = u64::from_str_radix(score_str, 16).map_err(|_| RecordError::Score(score_str.to_string()))?;

    let expires_at = std::str::from_utf8(expiry_raw)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| RecordError::Expiry(lossy(expiry_raw)))?;

    let txn_len = std::str::from_utf8(txn_len_raw)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| RecordError::Txn(format!("bad length {:?}", lossy(txn_len_raw))))?;
    if rest.len() < txn_len {
        return Err(RecordError::Truncated);
    }
    let (txn_raw, value) = rest.split_at(txn_len);
    let txn = std::str::from_utf8(txn_raw).map_err(|e| RecordError::Txn(e.to_string()))?;

    Ok(StoredRecord {
        score: f64::from_bits(bits),
        txn: Txn::from(txn),
        expires_at,
        value: value.to_vec(),
    })
}

fn split_at_byte(buf: &[u8], delim: u8) -> Result<(&[u8], &[u8]), RecordError> {
    let pos = buf
        .iter()
        .position(|b| *b == delim)
        .ok_or(RecordError::Truncated)?;
    Ok((&buf[..pos], &buf[pos + 1..]))
}

fn lossy(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_exact() {
        let txn = Txn::from("txn|with:delims");
        let value = b"payload|with:delims\x00\xff".to_vec();
        let packed = pack(42.125, &txn, 1_700_000_000_000, &value);
        let rec = unpack(&packed).unwrap();
        assert_eq!(rec.score, 42.125);
        assert_eq!(rec.txn, txn);
        assert_eq!(rec.expires_at, 1_700_000_000_000);
        assert_eq!(rec.value, value);
    }

    #[test]
    fn test_special_scores_keep_their_bits() {
        let txn = Txn::from("t");
        for score in [-0.0, f64::INFINITY, f64::NEG_INFINITY, f64::MIN_POSITIVE, f64::NAN] {
            let rec = unpack(&pack(score, &txn, 0, b"")).unwrap();
            assert_eq!(rec.score.to_bits(), score.to_bits());
        }
    }

    #[test]
    fn test_unpack_rejects_malformed() {
        assert_eq!(unpack(b"nodelimiters"), Err(RecordError::Truncated));
        assert!(matches!(unpack(b"zz|0|0:"), Err(RecordError::Score(_))));
        assert!(matches!(
            unpack(b"0000000000000000|soon|0:"),
            Err(RecordError::Expiry(_))
        ));
        assert_eq!(
            unpack(b"0000000000000000|0|10:short"),
            Err(RecordError::Truncated)
        );
    }

    #[test]
    fn test_is_expired() {
        let rec = unpack(&pack(1.0, &Txn::from("t"), 500, b"v")).unwrap();
        assert!(!rec.is_expired(499));
        assert!(rec.is_expired(500));
        let forever = unpack(&pack(1.0, &Txn::from("t"), 0, b"v")).unwrap();
        assert!(!forever.is_expired(u64::MAX));
    }
}
