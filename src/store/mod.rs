//! Local durable store for offline support.
//!
//! Two collections live here:
//! - `members`: last known good copies of member records, keyed by server id
//! - `pendingActions`: mutations made while offline, keyed by an increasing
//!   insertion sequence so iteration order is submission order

mod records;
mod schema;
mod storage;

pub use records::{CachedRecord, Collection, QueuedAction, Record, RecordKey};
pub use storage::{DurableStore, SqliteStore};
