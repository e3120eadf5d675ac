//! The blob store: an in-memory overlay merged over the last saved snapshot.

use crate::blobs::{SnapshotBuilder, StoredSnapshot};
use crate::error::{Result, StoreError};
use crate::lock::{ContentionPolicy, SaveLock};
use crate::subscriptions::{
    SubscriptionConfig, SubscriptionHandle, SubscriptionId, SubscriptionManager,
};
use crate::types::{SaveOutcome, StoreStats};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix of the offset index file.
pub const MAP_SUFFIX: &str = ".MAP";

/// Suffix of the lock sentinel.
pub const LOCK_SUFFIX: &str = ".LOCK";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Path of the blob file. The index and lock sentinel sit next to it.
    pub path: PathBuf,

    /// What to do when another writer holds the lock sentinel.
    pub contention: ContentionPolicy,

    /// Whether to fsync the blob and index after writing them.
    pub sync_on_save: bool,

    /// Whether to attempt a save when the store is dropped.
    pub save_on_drop: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store.blob"),
            contention: ContentionPolicy::Abandon,
            sync_on_save: true,
            save_on_drop: false,
        }
    }
}

impl StoreConfig {
    /// Default configuration for the blob file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Binary blob store backed by a blob file and a JSON offset index.
///
/// Reads resolve through the overlay first, then the stored snapshot.
/// Nothing touches the disk until [`save`](BlobStore::save), which rewrites
/// the whole pair under the lock sentinel.
pub struct BlobStore {
    /// Store configuration.
    config: StoreConfig,

    /// `<path>.MAP`
    map_path: PathBuf,

    /// `<path>.LOCK`
    lock_path: PathBuf,

    /// Keys set since the last load or save.
    overlay: BTreeMap<String, Vec<u8>>,

    /// The last loaded or saved pair.
    stored: StoredSnapshot,

    /// Change subscribers.
    subscriptions: SubscriptionManager,
}

impl BlobStore {
    /// Open the store at `path`, loading any saved pair.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_config(StoreConfig::new(path), Vec::<(String, Vec<u8>)>::new())
    }

    /// Open the store at `path` with an initial overlay.
    pub fn with_overlay<I, K, V>(path: impl Into<PathBuf>, overlay: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self::with_config(StoreConfig::new(path), overlay)
    }

    /// Open a store from a full configuration.
    ///
    /// Missing or corrupt files never fail construction; the stored side
    /// simply starts empty. Empty keys in `overlay` are skipped.
    pub fn with_config<I, K, V>(config: StoreConfig, overlay: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let map_path = sibling(&config.path, MAP_SUFFIX);
        let lock_path = sibling(&config.path, LOCK_SUFFIX);
        let stored = StoredSnapshot::load(&config.path, &map_path);

        let overlay = overlay
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(key, _): &(String, Vec<u8>)| {
                if key.is_empty() {
                    tracing::warn!(
                        path = %config.path.display(),
                        "skipping empty key in initial overlay"
                    );
                }
                !key.is_empty()
            })
            .collect();

        Self {
            config,
            map_path,
            lock_path,
            overlay,
            stored,
            subscriptions: SubscriptionManager::new(),
        }
    }

    // --- Mutations ---

    /// Set a single key.
    pub fn set(&mut self, key: impl Into<String>, blob: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key));
        }
        let blob = blob.into();

        let previous = if self.subscriptions.wants_key(&key) {
            Some(self.get(&key).map(<[u8]>::to_vec))
        } else {
            None
        };

        tracing::trace!(key = %key, bytes = blob.len(), "set");
        self.overlay.insert(key.clone(), blob);

        if let Some(previous) = previous {
            self.subscriptions
                .broadcast_change(&key, &self.overlay[&key], previous.as_deref());
        }

        Ok(())
    }

    /// Set every pair in order, as repeated [`set`](BlobStore::set) calls.
    pub fn set_many<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        for (key, blob) in entries {
            self.set(key, blob)?;
        }
        Ok(())
    }

    /// Remove a key from both the overlay and the stored index.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let in_overlay = self.overlay.remove(key).is_some();
        let in_stored = self.stored.remove(key);

        if in_overlay || in_stored {
            tracing::trace!(key = %key, "removed");
        }
        in_overlay || in_stored
    }

    /// Remove several keys. Returns how many were present.
    pub fn remove_many<'k, I>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'k str>,
    {
        keys.into_iter().filter(|key| self.remove(key)).count()
    }

    /// Discard all data in memory. The files are untouched until the next save.
    pub fn clear(&mut self) {
        self.overlay.clear();
        self.stored.clear();
    }

    // --- Reads ---

    /// Resolve a key: overlay first, then the stored snapshot.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        match self.overlay.get(key) {
            Some(blob) => Some(blob.as_slice()),
            None => self.stored.get(key),
        }
    }

    /// Resolve several keys at once.
    pub fn get_many<'k, I>(&self, keys: I) -> HashMap<&'k str, Option<&[u8]>>
    where
        I: IntoIterator<Item = &'k str>,
    {
        keys.into_iter().map(|key| (key, self.get(key))).collect()
    }

    /// Check if a key resolves to a value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.overlay.contains_key(key) || self.stored.contains_key(key)
    }

    /// The merged key set, sorted and free of duplicates.
    pub fn keys(&self) -> Vec<&str> {
        let merged: BTreeSet<&str> = self
            .overlay
            .keys()
            .map(String::as_str)
            .chain(self.stored.keys())
            .collect();
        merged.into_iter().collect()
    }

    /// Call `f(blob, key)` once for every key in the merged key set.
    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(&[u8], &str),
    {
        for key in self.keys() {
            if let Some(blob) = self.get(key) {
                f(blob, key);
            }
        }
    }

    /// Number of keys in the merged key set.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty() && self.stored.is_empty()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            overlay_entries: self.overlay.len(),
            stored_entries: self.stored.len(),
            stored_bytes: self.stored.blob_len(),
        }
    }

    /// Path of the blob file.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Path of the offset index file.
    pub fn map_path(&self) -> &Path {
        &self.map_path
    }

    /// Path of the lock sentinel.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    // --- Subscriptions ---

    /// Subscribe to change events.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    // --- Persistence ---

    /// Write a full snapshot of every key to disk.
    ///
    /// If another writer holds the lock sentinel the save is abandoned and
    /// `SaveOutcome::Abandoned` is returned; nothing is written. Other I/O
    /// errors are returned after the sentinel has been removed.
    pub fn save(&mut self) -> Result<SaveOutcome> {
        let snapshot = self.dump();

        let lock = match SaveLock::acquire(&self.lock_path, &self.config.contention)? {
            Some(lock) => lock,
            None => {
                tracing::warn!(
                    lock = %self.lock_path.display(),
                    "lock sentinel held by another writer; save abandoned"
                );
                return Ok(SaveOutcome::Abandoned);
            }
        };

        let written = snapshot.write(&self.config.path, &self.map_path, self.config.sync_on_save);
        let released = lock.release();
        written?;
        released?;

        let outcome = SaveOutcome::Saved {
            entries: snapshot.len(),
            bytes: snapshot.blob_len(),
        };
        tracing::debug!(path = %self.config.path.display(), ?outcome, "saved snapshot");

        self.stored = snapshot;
        self.overlay.clear();

        Ok(outcome)
    }

    /// Concatenate every resolved blob in merged key order.
    fn dump(&self) -> StoredSnapshot {
        let mut builder = SnapshotBuilder::new();
        self.each(|blob, key| builder.push(key, blob));
        builder.finish()
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        if self.config.save_on_drop {
            if let Err(e) = self.save() {
                tracing::warn!(path = %self.config.path.display(), error = %e, "save on drop failed");
            }
        }
    }
}

/// `path` with `suffix` appended to its final component.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
