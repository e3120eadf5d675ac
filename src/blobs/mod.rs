//! On-disk blob/index pair.
//!
//! Every stored blob lives in a single file as a raw concatenation with no
//! framing. A sibling `.MAP` file holds the JSON offset index that locates
//! each key's `[start, end)` range.

mod storage;

pub use storage::{SnapshotBuilder, StoredSnapshot};
