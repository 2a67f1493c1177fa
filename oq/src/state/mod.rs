//! State management with actor pattern
//!
//! OperationStore owns the storage backend and processes messages via
//! channels, providing serialized access to persistent state.

mod backend;
mod manager;
mod messages;
mod recovery;

pub use backend::{MemoryBackend, StorageBackend, TaskStoreBackend};
pub use manager::OperationStore;
pub use messages::{Mutator, StoreCommand};
pub use recovery::{RecoveryStats, recover};
