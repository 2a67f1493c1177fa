//! TaskStore - generic persistent record storage
//!
//! Records are appended to one JSONL file per collection, which is the
//! durable source of truth. A SQLite database next to the logs holds the
//! latest version of every record plus per-field indexes used by [`Store::list`].
//! The database is rebuilt from the logs on [`Store::sync`].
//!
//! # Layout
//!
//! ```text
//! <store-dir>/
//!   .lock            exclusive fs2 lock held while the Store is open
//!   taskstore.db     SQLite index (derived, safe to delete)
//!   <collection>.jsonl
//! ```

mod filter;
mod record;
mod store;

pub use filter::{Filter, FilterOp, IndexValue};
pub use record::Record;
pub use store::{Store, StoreStats};

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
