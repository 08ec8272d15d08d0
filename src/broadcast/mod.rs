pub mod coordinator;
pub mod router;

pub use coordinator::{BroadcastCoordinator, CoalesceMode};
pub use router::{ConsumerId, ConsumerSink, FanoutRouter, Frame};
