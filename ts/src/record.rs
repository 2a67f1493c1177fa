//! Record trait implemented by every stored type

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::IndexValue;

/// A record that can be persisted in a [`crate::Store`]
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds), used to pick the winner on sync
    fn updated_at(&self) -> i64;

    /// Collection name; also the JSONL file stem
    fn collection_name() -> &'static str;

    /// Fields exposed to [`crate::Filter`] queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
