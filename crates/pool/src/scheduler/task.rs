use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::PoolError;

/// Outcome delivered to the submitter of a task.
pub type TaskResult = Result<Value, PoolError>;

/// A queued unit of work awaiting dispatch.
///
/// Owning the responder means a request can be settled at most once:
/// [`settle`](TaskRequest::settle) consumes it.
#[derive(Debug)]
pub struct TaskRequest {
    pub(crate) id: Uuid,
    pub(crate) function_name: String,
    pub(crate) payload: Value,
    pub(crate) responder: oneshot::Sender<TaskResult>,
    pub(crate) submitted_at: Instant,
}

impl TaskRequest {
    /// Create a request together with the handle its submitter awaits.
    pub fn new(function_name: impl Into<String>, payload: Value) -> (Self, TaskHandle) {
        let (responder, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        let function_name = function_name.into();
        let handle = TaskHandle {
            id,
            function_name: function_name.clone(),
            receiver,
        };
        let request = Self {
            id,
            function_name,
            payload,
            responder,
            submitted_at: Instant::now(),
        };
        (request, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Deliver the outcome. A submitter that dropped its handle is ignored.
    pub fn settle(self, result: TaskResult) {
        let _ = self.responder.send(result);
    }
}

/// Future resolving to the result of a submitted task.
///
/// Resolves to `Err(PoolError::Terminated)` if the pool stops before the
/// task settles. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    function_name: String,
    receiver: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// A handle that is already settled, for requests rejected before enqueueing.
    pub(crate) fn settled(function_name: impl Into<String>, result: TaskResult) -> Self {
        let (request, handle) = TaskRequest::new(function_name, Value::Null);
        request.settle(result);
        handle
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Await the result and deserialize it into `R`.
    pub async fn decode<R: DeserializeOwned>(self) -> Result<R, PoolError> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Terminated)))
    }
}
