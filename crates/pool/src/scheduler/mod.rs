//! FIFO task dispatch across a fixed set of worker units.
//!
//! [`Pool`] is the caller-facing handle. All scheduling state lives in a
//! single coordinator task: a queue of pending [`TaskRequest`]s and one slot
//! per unit with its `busy` flag. Dispatch runs whenever a request is
//! enqueued or a unit reports a result, and always pairs the oldest request
//! with the lowest-numbered idle unit.

mod coordinator;
pub mod pool;
pub mod progress;
pub mod stats;
pub mod task;

pub use pool::{Pool, BATCH_ELEMENT_KEY};
pub use stats::{FunctionStats, PoolStats};
pub use task::{TaskHandle, TaskRequest, TaskResult};
