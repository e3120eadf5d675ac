//! Core types for the blob store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Byte range `[start, end)` of a blob inside the stored blob file.
///
/// Serialized as a two-element array, e.g. `[0,5]`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u64; 2]", into = "[u64; 2]")]
pub struct BlobRange {
    pub start: u64,
    pub end: u64,
}

impl BlobRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that the range is well formed and lies within `total` bytes.
    pub fn fits(&self, total: u64) -> bool {
        self.start <= self.end && self.end <= total
    }
}

impl fmt::Debug for BlobRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<[u64; 2]> for BlobRange {
    fn from([start, end]: [u64; 2]) -> Self {
        Self { start, end }
    }
}

impl From<BlobRange> for [u64; 2] {
    fn from(range: BlobRange) -> Self {
        [range.start, range.end]
    }
}

/// Offset index persisted next to the blob file.
pub type StoredIndex = BTreeMap<String, BlobRange>;

/// Result of a save attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The blob and index files were rewritten.
    Saved {
        /// Number of keys written.
        entries: usize,
        /// Size of the written blob file.
        bytes: u64,
    },
    /// Another writer held the lock sentinel; nothing was written.
    Abandoned,
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Keys held in the in-memory overlay.
    pub overlay_entries: usize,
    /// Keys present in the stored index.
    pub stored_entries: usize,
    /// Size of the stored blob held in memory.
    pub stored_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_serializes_as_pair() {
        let json = serde_json::to_string(&BlobRange::new(0, 5)).unwrap();
        assert_eq!(json, "[0,5]");

        let range: BlobRange = serde_json::from_str("[3,9]").unwrap();
        assert_eq!(range, BlobRange::new(3, 9));
        assert_eq!(range.len(), 6);
    }

    #[test]
    fn test_range_rejects_wrong_arity() {
        assert!(serde_json::from_str::<BlobRange>("[1]").is_err());
        assert!(serde_json::from_str::<BlobRange>("[1,2,3]").is_err());
        assert!(serde_json::from_str::<BlobRange>("{\"start\":1}").is_err());
    }

    #[test]
    fn test_range_fits() {
        assert!(BlobRange::new(0, 0).fits(0));
        assert!(BlobRange::new(2, 4).fits(4));
        assert!(!BlobRange::new(2, 5).fits(4));
        assert!(!BlobRange::new(3, 2).fits(4));
    }
}
