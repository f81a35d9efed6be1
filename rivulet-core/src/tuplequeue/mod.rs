//! Tuple buffering: FIFO queues, drain policies, per-partition containers,
//! per-operator queues and the thread-safe pipeline inbox.

pub mod container;
pub mod drainer;
pub mod inbox;
pub mod operator_queue;
pub mod queue;

pub use container::*;
pub use drainer::*;
pub use inbox::*;
pub use operator_queue::*;
pub use queue::*;
