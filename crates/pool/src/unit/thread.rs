use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::config::UnitConfig;
use crate::error::PoolError;
use crate::handler::{HandlerRegistry, UnitContext};

use super::{UnitSpawner, WorkerUnit};

/// A worker unit backed by a dedicated OS thread.
///
/// Tasks and results cross the thread boundary as encoded envelopes, the
/// same bytes a process unit would see on its pipes.
pub struct ThreadUnit {
    id: usize,
    tasks: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    results: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    stopped: Arc<AtomicBool>,
}

impl ThreadUnit {
    /// Start the unit thread.
    pub fn start(
        id: usize,
        config: &UnitConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, PoolError> {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let stopped = Arc::new(AtomicBool::new(false));

        let ctx = UnitContext::new(id, config.clone());
        let thread_stopped = Arc::clone(&stopped);
        std::thread::Builder::new()
            .name(format!("taskpool-unit-{id}"))
            .spawn(move || {
                while let Some(frame) = task_rx.blocking_recv() {
                    if thread_stopped.load(Ordering::Acquire) {
                        break;
                    }
                    trace!(unit_id = ctx.unit_id, bytes = frame.len(), "thread unit received task");
                    let out = registry.execute(&frame, &ctx);
                    if thread_stopped.load(Ordering::Acquire) || result_tx.send(out).is_err() {
                        break;
                    }
                }
                debug!(unit_id = ctx.unit_id, "thread unit exiting");
            })
            .map_err(|e| PoolError::Construction {
                unit_id: id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            tasks: Mutex::new(Some(task_tx)),
            results: Mutex::new(result_rx),
            stopped,
        })
    }
}

#[async_trait]
impl WorkerUnit for ThreadUnit {
    fn id(&self) -> usize {
        self.id
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), PoolError> {
        let tasks = self.tasks.lock().await;
        let tx = tasks.as_ref().ok_or(PoolError::UnitLost { unit_id: self.id })?;
        tx.send(frame)
            .map_err(|_| PoolError::UnitLost { unit_id: self.id })
    }

    async fn next_result(&self) -> Option<Vec<u8>> {
        self.results.lock().await.recv().await
    }

    async fn terminate(&self) {
        self.stopped.store(true, Ordering::Release);
        // Closing the task channel ends the thread loop once the current task returns.
        self.tasks.lock().await.take();
        debug!(unit_id = self.id, "thread unit terminated");
    }
}

/// Spawns [`ThreadUnit`]s sharing one handler registry.
#[derive(Clone)]
pub struct ThreadSpawner {
    registry: Arc<HandlerRegistry>,
}

impl ThreadSpawner {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

#[async_trait]
impl UnitSpawner for ThreadSpawner {
    async fn spawn(&self, id: usize, config: &UnitConfig) -> Result<Arc<dyn WorkerUnit>, PoolError> {
        let unit = ThreadUnit::start(id, config, Arc::clone(&self.registry))?;
        Ok(Arc::new(unit))
    }
}
