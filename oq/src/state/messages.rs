//! Operation store messages
//!
//! Commands and responses for the actor pattern.

use tokio::sync::oneshot;

use crate::domain::{Operation, OperationFilter};
use crate::error::QueueResult;

/// In-place change applied inside the actor to a copy of the stored operation
///
/// Returning an error discards the copy and leaves the record untouched.
pub type Mutator = Box<dyn FnOnce(&mut Operation) -> QueueResult<()> + Send>;

/// Reply channel for a command
pub type Reply<T> = oneshot::Sender<QueueResult<T>>;

/// Commands sent to the OperationStore actor
pub enum StoreCommand {
    Add {
        operation: Operation,
        reply: Reply<Operation>,
    },
    Get {
        id: String,
        reply: Reply<Option<Operation>>,
    },
    List {
        filter: OperationFilter,
        reply: Reply<Vec<Operation>>,
    },
    Update {
        id: String,
        mutator: Mutator,
        reply: Reply<Operation>,
    },
    Remove {
        id: String,
        reply: Reply<Operation>,
    },
    RemoveWhere {
        filter: OperationFilter,
        reply: Reply<Vec<String>>,
    },
    SetDurable {
        durable: bool,
        reply: Reply<()>,
    },
    Flush {
        reply: Reply<()>,
    },
    /// Flush, then drop the backend and stop
    Close {
        reply: Reply<()>,
    },
}

impl StoreCommand {
    /// Command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "Add",
            Self::Get { .. } => "Get",
            Self::List { .. } => "List",
            Self::Update { .. } => "Update",
            Self::Remove { .. } => "Remove",
            Self::RemoveWhere { .. } => "RemoveWhere",
            Self::SetDurable { .. } => "SetDurable",
            Self::Flush { .. } => "Flush",
            Self::Close { .. } => "Close",
        }
    }
}

impl std::fmt::Debug for StoreCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreCommand::{}", self.name())
    }
}
