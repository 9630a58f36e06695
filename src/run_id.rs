//! Monotonic, sortable run identifiers: `exec-YYYYMMDD-HHMMSS-<8 hex>`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Process-wide counter folded into the hex suffix so that two RunIDs minted
/// within the same wall-clock second never collide, without pulling in a
/// dedicated randomness crate (the corpus already depends on `sha2`/`hex` for
/// content-addressed hashing elsewhere, so the suffix reuses that pattern).
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a fresh RunID. Lexicographic ordering of the result matches
    /// creation order across seconds because the timestamp prefix is
    /// fixed-width; within the same second, ordering is not guaranteed by
    /// the hex suffix alone, which the spec does not require.
    pub fn new() -> Self {
        let now = Utc::now();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let nanos = now.timestamp_nanos_opt().unwrap_or(0);
        let pid = std::process::id();

        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(pid.to_le_bytes());
        hasher.update(seq.to_le_bytes());
        let digest = hasher.finalize();
        let suffix = hex::encode(&digest[..4]);

        let timestamp = now.format("%Y%m%d-%H%M%S");
        Self(format!("exec-{timestamp}-{suffix}"))
    }

    /// Wrap an existing, already-formatted run id (used when rehydrating
    /// persisted state).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_matches_grammar() {
        let id = RunId::new();
        let s = id.as_str();
        assert!(s.starts_with("exec-"));
        let rest = &s["exec-".len()..];
        let parts: Vec<&str> = rest.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8); // YYYYMMDD
        assert_eq!(parts[1].len(), 6); // HHMMSS
        assert_eq!(parts[2].len(), 8); // hex suffix
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unique_within_same_process() {
        let ids: Vec<RunId> = (0..64).map(|_| RunId::new()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn roundtrips_through_serde() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
