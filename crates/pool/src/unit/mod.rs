//! Worker units: isolated execution contexts running one task at a time.
//!
//! The pool only sees the [`WorkerUnit`] boundary: it hands a unit one
//! encoded [`TaskEnvelope`](crate::envelope::TaskEnvelope), then waits for
//! exactly one encoded [`ResultEnvelope`](crate::envelope::ResultEnvelope).
//! What runs inside is up to the implementation:
//!
//! - [`ThreadUnit`] runs a [`HandlerRegistry`](crate::handler::HandlerRegistry)
//!   on a dedicated OS thread.
//! - [`ProcessUnit`] runs the `taskpool-unit` host as a child process and
//!   exchanges one JSON line per envelope over its stdin/stdout.

pub mod host;
pub mod process;
pub mod thread;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::UnitConfig;
use crate::error::PoolError;

pub use host::run_unit_host;
pub use process::{ProcessSpawner, ProcessUnit};
pub use thread::{ThreadSpawner, ThreadUnit};

/// An execution context that accepts one encoded task at a time.
///
/// The pool never calls [`send`](WorkerUnit::send) again before it has
/// received the result of the previous task.
#[async_trait]
pub trait WorkerUnit: Send + Sync {
    /// Unit id, unique within a pool.
    fn id(&self) -> usize;

    /// Hand the unit one encoded task envelope.
    async fn send(&self, frame: Vec<u8>) -> Result<(), PoolError>;

    /// Wait for the result of the task most recently sent.
    ///
    /// Returns `None` when the unit is gone and will never answer.
    async fn next_result(&self) -> Option<Vec<u8>>;

    /// Stop the unit without waiting for an in-flight task.
    async fn terminate(&self);
}

/// Creates worker units for a pool.
#[async_trait]
pub trait UnitSpawner: Send + Sync {
    /// Start unit `id`. Failures abort pool construction.
    async fn spawn(&self, id: usize, config: &UnitConfig) -> Result<Arc<dyn WorkerUnit>, PoolError>;
}

/// Blanket implementation so `Arc<dyn UnitSpawner>` can be passed directly.
#[async_trait]
impl<T: UnitSpawner + ?Sized> UnitSpawner for Arc<T> {
    async fn spawn(&self, id: usize, config: &UnitConfig) -> Result<Arc<dyn WorkerUnit>, PoolError> {
        (**self).spawn(id, config).await
    }
}
