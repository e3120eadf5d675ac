//! Stored snapshot implementation.

use crate::error::{Result, StoreError};
use crate::types::{BlobRange, StoredIndex};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// The last saved blob/index pair, held in memory.
#[derive(Clone, Debug, Default)]
pub struct StoredSnapshot {
    /// Concatenation of every stored blob.
    blob: Vec<u8>,

    /// Key to byte range within `blob`.
    index: StoredIndex,
}

impl StoredSnapshot {
    /// Create an empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a blob and its index, validating every range.
    pub fn from_parts(blob: Vec<u8>, index: StoredIndex) -> Result<Self> {
        let total = blob.len() as u64;
        if let Some((key, range)) = index.iter().find(|(_, range)| !range.fits(total)) {
            return Err(StoreError::Corruption(format!(
                "range {:?} for key {:?} exceeds blob of {} bytes",
                range, key, total
            )));
        }

        Ok(Self { blob, index })
    }

    /// Read the pair from disk.
    ///
    /// Returns `Ok(None)` when either file is absent.
    pub fn read(blob_path: &Path, map_path: &Path) -> Result<Option<Self>> {
        let blob = match read_optional(blob_path)? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        let map = match read_optional(map_path)? {
            Some(map) => map,
            None => return Ok(None),
        };

        let index: StoredIndex = serde_json::from_slice(&map)
            .map_err(|e| StoreError::Corruption(format!("unparsable index: {}", e)))?;

        Self::from_parts(blob, index).map(Some)
    }

    /// Load the pair from disk, degrading to an empty snapshot.
    ///
    /// Missing, unreadable or inconsistent files are never partially trusted.
    pub fn load(blob_path: &Path, map_path: &Path) -> Self {
        match Self::read(blob_path, map_path) {
            Ok(Some(snapshot)) => {
                tracing::debug!(
                    path = %blob_path.display(),
                    entries = snapshot.len(),
                    bytes = snapshot.blob_len(),
                    "loaded stored snapshot"
                );
                snapshot
            }
            Ok(None) => {
                if blob_path.exists() || map_path.exists() {
                    tracing::warn!(
                        path = %blob_path.display(),
                        "blob and index must exist as a pair; starting empty"
                    );
                }
                Self::empty()
            }
            Err(e) => {
                tracing::warn!(
                    path = %blob_path.display(),
                    error = %e,
                    "discarding unreadable stored snapshot"
                );
                Self::empty()
            }
        }
    }

    /// Get the stored bytes for a key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        let range = self.index.get(key)?;
        // Ranges are validated against the blob length on construction.
        Some(&self.blob[range.start as usize..range.end as usize])
    }

    /// Check if a key is in the index.
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Drop a key from the index. Its bytes stay in the blob until the next save.
    pub fn remove(&mut self, key: &str) -> bool {
        self.index.remove(key).is_some()
    }

    /// Forget the whole blob and index.
    pub fn clear(&mut self) {
        self.blob = Vec::new();
        self.index.clear();
    }

    /// Indexed keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Size of the held blob in bytes.
    pub fn blob_len(&self) -> u64 {
        self.blob.len() as u64
    }

    /// The raw concatenated blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// The offset index.
    pub fn index(&self) -> &StoredIndex {
        &self.index
    }

    /// Write the blob to `blob_path`, then the JSON index to `map_path`.
    pub fn write(&self, blob_path: &Path, map_path: &Path, sync: bool) -> Result<()> {
        let map = serde_json::to_vec(&self.index)?;

        write_file(blob_path, &self.blob, sync)?;
        write_file(map_path, &map, sync)?;

        Ok(())
    }
}

/// Builds a contiguous snapshot, one key at a time.
///
/// Each pushed blob starts where the previous one ended, so the ranges
/// partition the blob with no gaps or overlaps.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    blob: Vec<u8>,
    index: StoredIndex,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a blob under `key`.
    pub fn push(&mut self, key: &str, bytes: &[u8]) {
        debug_assert!(!self.index.contains_key(key), "duplicate key {:?}", key);

        let start = self.blob.len() as u64;
        self.blob.extend_from_slice(bytes);
        let end = self.blob.len() as u64;

        self.index.insert(key.to_string(), BlobRange::new(start, end));
    }

    pub fn finish(self) -> StoredSnapshot {
        StoredSnapshot {
            blob: self.blob,
            index: self.index,
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_file(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    file.write_all(bytes)?;
    if sync {
        file.sync_all()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        (dir.path().join("data"), dir.path().join("data.MAP"))
    }

    #[test]
    fn test_builder_partitions_blob() {
        let mut builder = SnapshotBuilder::new();
        builder.push("a", b"xy");
        builder.push("b", b"");
        builder.push("c", b"z");

        let snapshot = builder.finish();
        assert_eq!(snapshot.blob(), b"xyz");
        assert_eq!(snapshot.index()["a"], BlobRange::new(0, 2));
        assert_eq!(snapshot.index()["b"], BlobRange::new(2, 2));
        assert_eq!(snapshot.index()["c"], BlobRange::new(2, 3));
        assert_eq!(snapshot.get("b"), Some(&b""[..]));
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let (blob_path, map_path) = paths(&dir);

        let mut builder = SnapshotBuilder::new();
        builder.push("name", b"licia");
        builder.finish().write(&blob_path, &map_path, true).unwrap();

        assert_eq!(fs::read(&blob_path).unwrap(), b"licia");
        assert_eq!(fs::read_to_string(&map_path).unwrap(), r#"{"name":[0,5]}"#);

        let snapshot = StoredSnapshot::read(&blob_path, &map_path).unwrap().unwrap();
        assert_eq!(snapshot.get("name"), Some(&b"licia"[..]));
    }

    #[test]
    fn test_read_requires_both_files() {
        let dir = TempDir::new().unwrap();
        let (blob_path, map_path) = paths(&dir);

        fs::write(&blob_path, b"abc").unwrap();
        assert!(StoredSnapshot::read(&blob_path, &map_path).unwrap().is_none());

        fs::remove_file(&blob_path).unwrap();
        fs::write(&map_path, br#"{"a":[0,3]}"#).unwrap();
        assert!(StoredSnapshot::read(&blob_path, &map_path).unwrap().is_none());
    }

    #[test]
    fn test_out_of_bounds_range_is_corruption() {
        let dir = TempDir::new().unwrap();
        let (blob_path, map_path) = paths(&dir);

        fs::write(&blob_path, b"abc").unwrap();
        fs::write(&map_path, br#"{"a":[0,2],"b":[2,10]}"#).unwrap();

        let result = StoredSnapshot::read(&blob_path, &map_path);
        assert!(matches!(result, Err(StoreError::Corruption(_))));

        let snapshot = StoredSnapshot::load(&blob_path, &map_path);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.blob_len(), 0);
    }

    #[test]
    fn test_remove_keeps_bytes_until_rewrite() {
        let mut builder = SnapshotBuilder::new();
        builder.push("a", b"12");
        builder.push("b", b"3");
        let mut snapshot = builder.finish();

        assert!(snapshot.remove("a"));
        assert!(!snapshot.remove("a"));
        assert_eq!(snapshot.get("a"), None);
        assert_eq!(snapshot.get("b"), Some(&b"3"[..]));
        assert_eq!(snapshot.blob_len(), 3);
    }
}
