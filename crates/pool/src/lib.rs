pub mod builtin;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod scheduler;
pub mod unit;

pub use config::{PoolConfig, ProcessConfig, UnitConfig};
pub use envelope::{ResultEnvelope, TaskEnvelope};
pub use error::PoolError;
pub use handler::{FnHandler, HandlerError, HandlerRegistry, TaskHandler, UnitContext};
pub use scheduler::{FunctionStats, Pool, PoolStats, TaskHandle, TaskRequest, TaskResult};
pub use unit::{
    run_unit_host, ProcessSpawner, ProcessUnit, ThreadSpawner, ThreadUnit, UnitSpawner,
    WorkerUnit,
};
