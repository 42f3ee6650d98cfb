//! The single task that owns all mutable pool state.
//!
//! The request queue and the per-unit `busy` flags are only ever touched
//! here, so dequeue-and-assign, mark-busy and mark-idle cannot interleave
//! with each other. Unit I/O runs in one completion task per dispatch; each
//! reports exactly one [`Completion`] back and then ends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::envelope::{ResultEnvelope, TaskEnvelope};
use crate::error::PoolError;
use crate::unit::WorkerUnit;

use super::stats::PoolStats;
use super::task::{TaskRequest, TaskResult};

/// Requests from [`Pool`](super::Pool) handles.
pub(crate) enum Command {
    Submit(TaskRequest),
    Stats(oneshot::Sender<PoolStats>),
    Terminate(oneshot::Sender<()>),
}

/// What a completion task observed on its unit.
enum UnitOutcome {
    /// The unit answered with a result frame.
    Answered(Vec<u8>),
    /// The unit refused the task frame.
    SendFailed(PoolError),
    /// The unit went away before answering.
    Lost,
}

struct Completion {
    unit_id: usize,
    outcome: UnitOutcome,
}

/// The request currently running on a unit.
struct InFlight {
    request_id: Uuid,
    function_name: String,
    responder: oneshot::Sender<TaskResult>,
    dispatched_at: Instant,
}

/// One worker unit and its scheduling state.
struct UnitSlot {
    unit: Arc<dyn WorkerUnit>,
    /// Set from assignment until the result is processed.
    busy: bool,
    /// Set when the unit is lost; a retired unit is never selected again.
    retired: bool,
    in_flight: Option<InFlight>,
    completion: Option<JoinHandle<()>>,
}

impl UnitSlot {
    fn is_idle(&self) -> bool {
        !self.busy && !self.retired
    }
}

pub(crate) struct Coordinator {
    slots: Vec<UnitSlot>,
    queue: VecDeque<TaskRequest>,
    stats: PoolStats,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl Coordinator {
    pub(crate) fn new(units: Vec<Arc<dyn WorkerUnit>>) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let stats = PoolStats {
            unit_count: units.len(),
            ..Default::default()
        };
        let slots = units
            .into_iter()
            .map(|unit| UnitSlot {
                unit,
                busy: false,
                retired: false,
                in_flight: None,
                completion: None,
            })
            .collect();

        Self {
            slots,
            queue: VecDeque::new(),
            stats,
            completion_tx,
            completion_rx,
        }
    }

    /// Process commands and completions until terminated or every handle is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                Some(completion) = self.completion_rx.recv() => {
                    self.on_completion(completion);
                }
                command = commands.recv() => match command {
                    Some(Command::Submit(request)) => self.enqueue(request),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Terminate(reply)) => {
                        commands.close();
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("all pool handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
    }

    fn enqueue(&mut self, request: TaskRequest) {
        if self.live_units() == 0 {
            request.settle(Err(PoolError::NoLiveUnits));
            return;
        }
        trace!(
            request_id = %request.id,
            function = %request.function_name,
            queued = self.queue.len() + 1,
            "task enqueued"
        );
        self.queue.push_back(request);
        self.dispatch();
    }

    /// Assign queued requests to idle units, oldest request to lowest unit id,
    /// until either runs out.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(unit_id) = self.slots.iter().position(UnitSlot::is_idle) else {
                break;
            };
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            self.assign(unit_id, request);
        }
    }

    fn assign(&mut self, unit_id: usize, request: TaskRequest) {
        let TaskRequest {
            id: request_id,
            function_name,
            payload,
            responder,
            submitted_at,
        } = request;

        let frame = match TaskEnvelope::new(function_name.clone(), payload).to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.failed += 1;
                let _ = responder.send(Err(e.into()));
                return;
            }
        };

        debug!(
            unit_id,
            request_id = %request_id,
            function = %function_name,
            waited_ms = submitted_at.elapsed().as_millis(),
            "dispatching task"
        );

        let slot = &mut self.slots[unit_id];
        slot.busy = true;
        slot.in_flight = Some(InFlight {
            request_id,
            function_name,
            responder,
            dispatched_at: Instant::now(),
        });

        let unit = Arc::clone(&slot.unit);
        let completions = self.completion_tx.clone();
        slot.completion = Some(tokio::spawn(async move {
            let outcome = match unit.send(frame).await {
                Ok(()) => match unit.next_result().await {
                    Some(bytes) => UnitOutcome::Answered(bytes),
                    None => UnitOutcome::Lost,
                },
                Err(e) => UnitOutcome::SendFailed(e),
            };
            let _ = completions.send(Completion { unit_id, outcome });
        }));
    }

    fn on_completion(&mut self, completion: Completion) {
        let unit_id = completion.unit_id;
        let Some(slot) = self.slots.get_mut(unit_id) else {
            warn!(unit_id, "completion for unknown unit");
            return;
        };
        slot.completion = None;
        let Some(in_flight) = slot.in_flight.take() else {
            warn!(unit_id, "completion for a unit with no task in flight ignored");
            return;
        };

        let result = match completion.outcome {
            UnitOutcome::Answered(bytes) => match decode_result(&in_flight.function_name, &bytes) {
                // Results are matched to tasks by order only, so a unit that
                // emitted an undecodable frame can no longer be trusted.
                Err(e @ PoolError::Protocol(_)) => {
                    slot.retired = true;
                    warn!(
                        unit_id,
                        request_id = %in_flight.request_id,
                        error = %e,
                        "unit sent an undecodable result, retiring it"
                    );
                    let unit = Arc::clone(&slot.unit);
                    tokio::spawn(async move { unit.terminate().await });
                    Err(e)
                }
                result => {
                    slot.busy = false;
                    result
                }
            },
            UnitOutcome::SendFailed(PoolError::UnitLost { .. }) | UnitOutcome::Lost => {
                slot.retired = true;
                warn!(
                    unit_id,
                    request_id = %in_flight.request_id,
                    function = %in_flight.function_name,
                    "unit lost, retiring it"
                );
                Err(PoolError::UnitLost { unit_id })
            }
            UnitOutcome::SendFailed(e) => {
                slot.busy = false;
                Err(e)
            }
        };

        let elapsed = in_flight.dispatched_at.elapsed();
        match &result {
            Ok(_) => self.stats.completed += 1,
            Err(PoolError::UnitLost { .. }) => self.stats.lost += 1,
            Err(_) => self.stats.failed += 1,
        }
        self.stats
            .record_execution(&in_flight.function_name, elapsed, result.is_ok());

        match &result {
            Ok(_) => debug!(
                unit_id,
                request_id = %in_flight.request_id,
                elapsed_ms = elapsed.as_millis(),
                "task completed"
            ),
            Err(e) => debug!(
                unit_id,
                request_id = %in_flight.request_id,
                error = %e,
                "task failed"
            ),
        }
        let _ = in_flight.responder.send(result);

        if self.live_units() == 0 {
            self.fail_queue(|| PoolError::NoLiveUnits);
        } else {
            self.dispatch();
        }
    }

    fn live_units(&self) -> usize {
        self.slots.iter().filter(|s| !s.retired).count()
    }

    fn fail_queue(&mut self, error: fn() -> PoolError) {
        let dropped = self.queue.len();
        for request in self.queue.drain(..) {
            request.settle(Err(error()));
        }
        if dropped > 0 {
            warn!(dropped, "rejected queued tasks");
        }
    }

    fn snapshot(&self) -> PoolStats {
        let mut stats = self.stats.clone();
        stats.busy_units = self.slots.iter().filter(|s| s.busy && !s.retired).count();
        stats.retired_units = self.slots.iter().filter(|s| s.retired).count();
        stats.queued = self.queue.len();
        stats
    }

    /// Settle everything outstanding with `Terminated` and stop every unit.
    async fn shutdown(&mut self) {
        let queued = self.queue.len();
        self.fail_queue(|| PoolError::Terminated);

        let mut abandoned = 0usize;
        for slot in &mut self.slots {
            if let Some(handle) = slot.completion.take() {
                handle.abort();
            }
            if let Some(in_flight) = slot.in_flight.take() {
                abandoned += 1;
                let _ = in_flight.responder.send(Err(PoolError::Terminated));
            }
        }

        join_all(self.slots.iter().map(|slot| slot.unit.terminate())).await;
        info!(queued, abandoned, units = self.slots.len(), "pool terminated");
    }
}

fn decode_result(function_name: &str, bytes: &[u8]) -> TaskResult {
    let envelope = ResultEnvelope::from_bytes(bytes)
        .map_err(|e| PoolError::Protocol(format!("undecodable result frame: {e}")))?;
    envelope
        .into_result()
        .map_err(|message| PoolError::TaskFailed {
            function_name: function_name.to_string(),
            message,
        })
}
