use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::config::{PoolConfig, UnitConfig};
use crate::error::PoolError;
use crate::unit::{UnitSpawner, WorkerUnit};

use super::coordinator::{Command, Coordinator};
use super::progress::{finished_text, running_text};
use super::stats::PoolStats;
use super::task::{TaskHandle, TaskRequest};

/// Key under which [`Pool::submit_batch`] stores each item in its payload.
pub const BATCH_ELEMENT_KEY: &str = "element";

/// Handle to a fixed-size pool of worker units.
///
/// Cloning the handle is cheap; all clones talk to the same coordinator.
/// The pool terminates when [`terminate`](Pool::terminate) is called or when
/// the last handle is dropped.
#[derive(Clone)]
pub struct Pool {
    commands: mpsc::UnboundedSender<Command>,
    unit_count: usize,
}

impl Pool {
    /// Spawn `unit_count` units eagerly and start the coordinator.
    ///
    /// Must be called from within a tokio runtime. If any unit fails to
    /// start, the units already created are terminated and the failure is
    /// returned.
    pub async fn new(
        unit_count: usize,
        unit_config: UnitConfig,
        spawner: &dyn UnitSpawner,
    ) -> Result<Self, PoolError> {
        if unit_count == 0 {
            return Err(PoolError::Config("unit count must be at least 1".into()));
        }

        let unit_config = UnitConfig {
            threads: unit_count,
            ..unit_config
        };
        info!(units = unit_count, "initializing task pool");

        let mut units: Vec<Arc<dyn WorkerUnit>> = Vec::with_capacity(unit_count);
        for id in 0..unit_count {
            match spawner.spawn(id, &unit_config).await {
                Ok(unit) => units.push(unit),
                Err(e) => {
                    warn!(unit_id = id, error = %e, "unit failed to start, aborting pool construction");
                    join_all(units.iter().map(|unit| unit.terminate())).await;
                    return Err(match e {
                        PoolError::Construction { .. } => e,
                        other => PoolError::Construction {
                            unit_id: id,
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(Coordinator::new(units).run(command_rx));

        info!(units = unit_count, "all units ready");
        Ok(Self {
            commands,
            unit_count,
        })
    }

    /// Build a pool from a [`PoolConfig`].
    pub async fn from_config(config: &PoolConfig, spawner: &dyn UnitSpawner) -> Result<Self, PoolError> {
        config.validate()?;
        Self::new(config.resolved_units(), config.unit.clone(), spawner).await
    }

    /// Number of units the pool was built with.
    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Whether the coordinator has stopped.
    pub fn is_terminated(&self) -> bool {
        self.commands.is_closed()
    }

    /// Enqueue a task and return a handle to its result.
    ///
    /// Never blocks. A payload that cannot be serialized yields a handle
    /// already settled with [`PoolError::Serialization`].
    pub fn submit<P: Serialize>(&self, function_name: &str, payload: P) -> TaskHandle {
        match serde_json::to_value(payload) {
            Ok(payload) => self.submit_value(function_name, payload),
            Err(e) => TaskHandle::settled(function_name, Err(e.into())),
        }
    }

    /// Enqueue a task whose payload is already a JSON value.
    pub fn submit_value(&self, function_name: &str, payload: Value) -> TaskHandle {
        let (request, handle) = TaskRequest::new(function_name, payload);
        // A closed channel drops the request, which settles the handle with `Terminated`.
        let _ = self.commands.send(Command::Submit(request));
        handle
    }

    /// Submit one task per item and wait for all of them to settle.
    ///
    /// Each payload is `shared_payload` with the item stored under
    /// [`BATCH_ELEMENT_KEY`]. Returns the first error in item order, but
    /// only after every task has settled.
    pub async fn submit_batch<T, P>(
        &self,
        function_name: &str,
        items: impl IntoIterator<Item = T>,
        shared_payload: P,
    ) -> Result<(), PoolError>
    where
        T: Serialize,
        P: Serialize,
    {
        self.collect_batch(function_name, items, shared_payload)
            .await?
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }

    /// Like [`submit_batch`](Pool::submit_batch), returning every result in item order.
    pub async fn collect_batch<T, P>(
        &self,
        function_name: &str,
        items: impl IntoIterator<Item = T>,
        shared_payload: P,
    ) -> Result<Vec<Result<Value, PoolError>>, PoolError>
    where
        T: Serialize,
        P: Serialize,
    {
        let payloads = batch_payloads(items, shared_payload)?;
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let handles: Vec<TaskHandle> = payloads
            .into_iter()
            .map(|payload| self.submit_value(function_name, payload))
            .collect();
        Ok(join_all(handles).await)
    }

    /// [`submit`](Pool::submit) with progress events for `task_name`.
    #[instrument(level = "debug", skip(self, payload))]
    pub async fn run<P: Serialize>(
        &self,
        task_name: &str,
        function_name: &str,
        payload: P,
    ) -> Result<Value, PoolError> {
        info!(task = task_name, "{}", running_text(task_name));
        let result = self.submit(function_name, payload).await;
        report(task_name, result.as_ref().err());
        result
    }

    /// [`submit_batch`](Pool::submit_batch) with progress events for `task_name`.
    #[instrument(level = "debug", skip(self, items, shared_payload))]
    pub async fn run_batch<T, P>(
        &self,
        task_name: &str,
        function_name: &str,
        items: impl IntoIterator<Item = T>,
        shared_payload: P,
    ) -> Result<(), PoolError>
    where
        T: Serialize,
        P: Serialize,
    {
        info!(task = task_name, "{}", running_text(task_name));
        let result = self.submit_batch(function_name, items, shared_payload).await;
        report(task_name, result.as_ref().err());
        result
    }

    /// Snapshot of unit and queue state plus execution counters.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(Command::Stats(reply))
            .map_err(|_| PoolError::Terminated)?;
        receiver.await.map_err(|_| PoolError::Terminated)
    }

    /// Stop every unit. Queued and in-flight tasks settle with
    /// [`PoolError::Terminated`]. Calling it again is a no-op.
    pub async fn terminate(&self) {
        let (reply, receiver) = oneshot::channel();
        if self.commands.send(Command::Terminate(reply)).is_err() {
            return;
        }
        // A dropped reply means another handle terminated the pool first.
        let _ = receiver.await;
    }
}

fn report(task_name: &str, error: Option<&PoolError>) {
    match error {
        None => info!(task = task_name, "{}", finished_text(task_name)),
        Some(e) => warn!(task = task_name, error = %e, "{} failed", task_name),
    }
}

/// Build one payload per item from the shared payload.
fn batch_payloads<T, P>(
    items: impl IntoIterator<Item = T>,
    shared_payload: P,
) -> Result<Vec<Value>, PoolError>
where
    T: Serialize,
    P: Serialize,
{
    let base = match serde_json::to_value(shared_payload)? {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(PoolError::InvalidPayload(format!(
                "shared batch payload must be an object, got {other}"
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            let mut payload = base.clone();
            payload.insert(BATCH_ELEMENT_KEY.to_string(), serde_json::to_value(item)?);
            Ok(Value::Object(payload))
        })
        .collect()
}
