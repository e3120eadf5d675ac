//! Lock sentinel guarding the save critical section.
//!
//! The sentinel is created with exclusive, non-blocking creation. While a
//! save holds it, the open handle also carries an `fs2` advisory lock so a
//! sentinel left behind by a crashed writer can be told apart from a live one.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// What `save` does when the lock sentinel already exists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ContentionPolicy {
    /// Give up immediately and write nothing.
    #[default]
    Abandon,

    /// Try again up to `attempts` more times, sleeping `backoff` in between.
    Retry { attempts: u32, backoff: Duration },

    /// Remove a sentinel older than `older_than` whose advisory lock is not
    /// held by anyone, then try once more.
    ReclaimStale { older_than: Duration },
}

/// Held lock sentinel. Dropping it removes the sentinel.
#[derive(Debug)]
pub struct SaveLock {
    path: PathBuf,
    file: Option<File>,
}

impl SaveLock {
    /// Acquire the sentinel at `path` under `policy`.
    ///
    /// Returns `Ok(None)` when another writer holds it. Any other I/O error
    /// is returned as is.
    pub fn acquire(path: &Path, policy: &ContentionPolicy) -> Result<Option<Self>> {
        match policy {
            ContentionPolicy::Abandon => Self::try_acquire(path),
            ContentionPolicy::Retry { attempts, backoff } => {
                for attempt in 0..=*attempts {
                    if let Some(lock) = Self::try_acquire(path)? {
                        return Ok(Some(lock));
                    }
                    if attempt < *attempts {
                        tracing::debug!(path = %path.display(), attempt, "lock busy, retrying");
                        thread::sleep(*backoff);
                    }
                }
                Ok(None)
            }
            ContentionPolicy::ReclaimStale { older_than } => {
                if let Some(lock) = Self::try_acquire(path)? {
                    return Ok(Some(lock));
                }
                if reclaim_stale(path, *older_than)? {
                    Self::try_acquire(path)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Single exclusive-create attempt.
    ///
    /// The sentinel only counts as held once its advisory lock is taken and
    /// the path still names the file that was created.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match file.try_lock_exclusive() {
            Ok(()) => {}
            // A reclaimer locked the fresh sentinel first and will remove it.
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
            Err(e) => {
                // No advisory locking on this filesystem; reclaimers cannot
                // lock either, so the sentinel alone excludes writers.
                tracing::debug!(path = %path.display(), error = %e, "advisory lock unavailable");
            }
        }

        if !names_file(path, &file)? {
            // Reclaimed and replaced between create and lock.
            return Ok(None);
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    /// Remove the sentinel, reporting failure.
    pub fn release(mut self) -> Result<()> {
        let file = self.file.take();
        remove_held(&self.path, file)?;
        Ok(())
    }
}

impl Drop for SaveLock {
    fn drop(&mut self) {
        // Only reached without `release`, e.g. while unwinding.
        if let Some(file) = self.file.take() {
            let _ = remove_held(&self.path, Some(file));
        }
    }
}

/// Remove the sentinel while its advisory lock is still held, then unlock.
#[cfg(unix)]
fn remove_held(path: &Path, file: Option<File>) -> std::io::Result<()> {
    let removed = fs::remove_file(path);
    if let Some(file) = file {
        let _ = file.unlock();
    }
    removed
}

/// Open files cannot be deleted here, so close first.
#[cfg(not(unix))]
fn remove_held(path: &Path, file: Option<File>) -> std::io::Result<()> {
    if let Some(file) = file {
        let _ = file.unlock();
    }
    fs::remove_file(path)
}

/// Check that `path` still names the file behind `file`.
fn names_file(path: &Path, file: &File) -> Result<bool> {
    let on_path = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(same_file(&on_path, &file.metadata()?))
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_: &fs::Metadata, _: &fs::Metadata) -> bool {
    // Held sentinels cannot be deleted or replaced while open.
    true
}

/// Remove the sentinel at `path` if it is stale. Returns true when the
/// sentinel is gone and creation may be retried.
fn reclaim_stale(path: &Path, older_than: Duration) -> Result<bool> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    // Age of the file actually opened, not of whatever the path named earlier.
    let age = file
        .metadata()?
        .modified()?
        .elapsed()
        .unwrap_or(Duration::ZERO);
    if age < older_than {
        return Ok(false);
    }

    if file.try_lock_exclusive().is_err() {
        return Ok(false);
    }
    if !names_file(path, &file)? {
        // Someone else already swapped the sentinel; let creation decide.
        let _ = file.unlock();
        return Ok(true);
    }

    tracing::warn!(
        path = %path.display(),
        age_secs = age.as_secs(),
        "removing stale lock sentinel"
    );
    match remove_held(path, Some(file)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");

        let lock = SaveLock::try_acquire(&path).unwrap().unwrap();
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        assert!(SaveLock::try_acquire(&path).unwrap().is_none());

        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");

        {
            let _lock = SaveLock::try_acquire(&path).unwrap().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_foreign_sentinel_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");
        fs::write(&path, b"").unwrap();

        let lock = SaveLock::acquire(&path, &ContentionPolicy::Abandon).unwrap();
        assert!(lock.is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_retry_gives_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");
        fs::write(&path, b"").unwrap();

        let policy = ContentionPolicy::Retry {
            attempts: 2,
            backoff: Duration::from_millis(5),
        };
        assert!(SaveLock::acquire(&path, &policy).unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_reclaim_orphaned_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");
        fs::write(&path, b"").unwrap();

        let policy = ContentionPolicy::ReclaimStale {
            older_than: Duration::ZERO,
        };
        let lock = SaveLock::acquire(&path, &policy).unwrap().unwrap();
        assert!(path.exists());
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_reclaim_respects_age() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");
        fs::write(&path, b"").unwrap();

        let policy = ContentionPolicy::ReclaimStale {
            older_than: Duration::from_secs(3600),
        };
        assert!(SaveLock::acquire(&path, &policy).unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_reclaim_skips_live_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.LOCK");

        let held = SaveLock::try_acquire(&path).unwrap().unwrap();
        let policy = ContentionPolicy::ReclaimStale {
            older_than: Duration::ZERO,
        };
        assert!(SaveLock::acquire(&path, &policy).unwrap().is_none());
        assert!(path.exists());

        held.release().unwrap();
    }

    #[test]
    fn test_unexpected_error_propagates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("data.LOCK");

        assert!(SaveLock::try_acquire(&path).is_err());
    }

    #[test]
    fn test_reclaim_never_admits_two_holders() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("data.LOCK"));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));

        // Holders outlive the staleness threshold, so every live sentinel
        // looks stale by age alone.
        let policy = ContentionPolicy::ReclaimStale {
            older_than: Duration::from_millis(1),
        };
        let deadline = Instant::now() + Duration::from_millis(1500);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let acquired = Arc::clone(&acquired);
                let policy = policy.clone();
                thread::spawn(move || {
                    while Instant::now() < deadline {
                        let lock = match SaveLock::acquire(&path, &policy).unwrap() {
                            Some(lock) => lock,
                            None => continue,
                        };
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        acquired.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(3));
                        active.fetch_sub(1, Ordering::SeqCst);
                        lock.release().unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(acquired.load(Ordering::SeqCst) > 0);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }
}
