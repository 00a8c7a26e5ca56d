//! Multi-device fan-out and the offline delivery queue.

mod backoff;
mod coordinator;
mod queue;
mod transport;

pub use backoff::Backoff;
pub use coordinator::{FanoutCoordinator, QueueReport};
pub use queue::{DeliveryStatus, QueueEntry, QueueStatus};
pub use transport::{MemoryTransport, Transport};
