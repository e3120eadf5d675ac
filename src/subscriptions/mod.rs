//! Change notification for blob stores.
//!
//! Every `set` on a [`BlobStore`](crate::BlobStore) broadcasts a
//! [`StoreEvent::Change`] carrying the key, the new blob and the value the
//! key resolved to beforehand. Subscriptions use bounded buffers; a slow or
//! disconnected subscriber is dropped rather than blocking the store.
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::keys(vec!["name".to_string()]),
//!     ..Default::default()
//! });
//!
//! store.set("name", b"licia".to_vec())?;
//!
//! for event in handle.drain() {
//!     if let StoreEvent::Change { key, previous, .. } = event {
//!         println!("{} changed (had value: {})", key, previous.is_some());
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
