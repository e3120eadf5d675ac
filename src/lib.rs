//! # File Blob Store
//!
//! A lightweight binary blob store. Values are byte buffers kept in an
//! in-memory overlay and merged over the last saved snapshot, which lives on
//! disk as two sibling files:
//!
//! - `<path>`: every blob concatenated, no header or framing
//! - `<path>.MAP`: JSON object mapping each key to `[start, end)`
//!
//! Saves rewrite both files in full while holding the `<path>.LOCK`
//! sentinel. A save that finds the sentinel already present is abandoned.
//!
//! ## Example
//!
//! ```no_run
//! use fileblob::BlobStore;
//!
//! let mut store = BlobStore::open("path/to/file");
//! store.set("name", b"licia".to_vec())?;
//! assert_eq!(store.get("name"), Some(&b"licia"[..]));
//! store.save()?;
//! # Ok::<(), fileblob::StoreError>(())
//! ```

pub mod blobs;
pub mod error;
pub mod lock;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use blobs::{SnapshotBuilder, StoredSnapshot};
pub use error::{Result, StoreError};
pub use lock::{ContentionPolicy, SaveLock};
pub use store::{BlobStore, StoreConfig, LOCK_SUFFIX, MAP_SUFFIX};
pub use subscriptions::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use types::*;
