//! Queue event channel
//!
//! The operation store emits a [`QueueEvent`] after every committed change.
//! A UI layer subscribes and drains them; polling `list`/`statistics` works
//! just as well and nothing in the engine depends on a subscriber existing.
//!
//! ```rust,ignore
//! let mut rx = queue.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("{}: {:?}", event.event_type(), event.operation_id());
//! }
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::QueueEvent;
