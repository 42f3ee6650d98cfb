//! Named task handlers executed inside worker units.
//!
//! A [`HandlerRegistry`] maps function names to [`TaskHandler`]s. Both unit
//! flavours (threads and child processes) run tasks through
//! [`HandlerRegistry::execute`], which turns one encoded task envelope into
//! exactly one encoded result envelope.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UnitConfig;
use crate::envelope::{ResultEnvelope, TaskEnvelope};

/// Error type returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Environment a handler runs in.
#[derive(Debug, Clone, Default)]
pub struct UnitContext {
    /// Id of the unit running the handler.
    pub unit_id: usize,
    /// Settings the pool handed to the unit.
    pub config: UnitConfig,
}

impl UnitContext {
    pub fn new(unit_id: usize, config: UnitConfig) -> Self {
        Self { unit_id, config }
    }
}

/// A named function that a worker unit can run.
pub trait TaskHandler: Send + Sync {
    /// Function name callers dispatch to.
    fn name(&self) -> &str;

    /// Run the handler on one payload.
    fn handle(&self, payload: Value, ctx: &UnitContext) -> Result<Value, HandlerError>;
}

/// Adapter turning a closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Value, &UnitContext) -> Result<Value, HandlerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Value, &UnitContext) -> Result<Value, HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, payload: Value, ctx: &UnitContext) -> Result<Value, HandlerError> {
        (self.func)(payload, ctx)
    }
}

/// Registry of handlers available to a unit.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        debug!(handler = handler.name(), "registered handler");
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Register a closure under `name`.
    pub fn register_fn<F>(&mut self, name: &str, func: F)
    where
        F: Fn(Value, &UnitContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnHandler::new(name, func)));
    }

    /// Builder-style [`register_fn`](Self::register_fn).
    pub fn with_fn<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(Value, &UnitContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_fn(name, func);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run a single task envelope and produce its result.
    ///
    /// Unknown functions and panicking handlers become `ok: false` results.
    pub fn run(&self, task: TaskEnvelope, ctx: &UnitContext) -> ResultEnvelope {
        let Some(handler) = self.get(&task.function_name) else {
            return ResultEnvelope::failure(format!("unknown function: {}", task.function_name));
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(task.payload, ctx))) {
            Ok(Ok(value)) => ResultEnvelope::success(value),
            Ok(Err(e)) => ResultEnvelope::failure(e.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(
                    unit_id = ctx.unit_id,
                    function = %task.function_name,
                    panic = %message,
                    "handler panicked"
                );
                ResultEnvelope::failure(format!("handler panicked: {message}"))
            }
        }
    }

    /// Decode one encoded task, run it, and encode the result.
    ///
    /// Always returns exactly one frame, so a unit never goes silent on a
    /// malformed request.
    pub fn execute(&self, frame: &[u8], ctx: &UnitContext) -> Vec<u8> {
        let result = match TaskEnvelope::from_bytes(frame) {
            Ok(task) => self.run(task, ctx),
            Err(e) => ResultEnvelope::failure(format!("invalid task envelope: {e}")),
        };
        result.to_bytes().unwrap_or_else(|e| {
            ResultEnvelope::failure(format!("result not serializable: {e}"))
                .to_bytes()
                .unwrap_or_else(|_| br#"{"ok":false}"#.to_vec())
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .with_fn("double", |payload, _ctx| {
                let n = payload
                    .as_i64()
                    .ok_or_else(|| HandlerError::InvalidPayload("expected integer".into()))?;
                Ok(json!(n * 2))
            })
            .with_fn("unit_id", |_payload, ctx| Ok(json!(ctx.unit_id)))
            .with_fn("explode", |_payload, _ctx| panic!("kaboom"))
    }

    #[test]
    fn runs_registered_handler() {
        let result = registry().run(TaskEnvelope::new("double", json!(21)), &UnitContext::default());
        assert_eq!(result.into_result(), Ok(json!(42)));
    }

    #[test]
    fn handler_sees_unit_context() {
        let ctx = UnitContext::new(3, UnitConfig::default());
        let result = registry().run(TaskEnvelope::new("unit_id", Value::Null), &ctx);
        assert_eq!(result.into_result(), Ok(json!(3)));
    }

    #[test]
    fn handler_error_becomes_failure() {
        let result = registry().run(TaskEnvelope::new("double", json!("x")), &UnitContext::default());
        let err = result.into_result().unwrap_err();
        assert!(err.contains("expected integer"), "got: {err}");
    }

    #[test]
    fn unknown_function_becomes_failure() {
        let result = registry().run(TaskEnvelope::new("missing", Value::Null), &UnitContext::default());
        assert_eq!(result.into_result(), Err("unknown function: missing".to_string()));
    }

    #[test]
    fn panic_becomes_failure() {
        let result = registry().run(TaskEnvelope::new("explode", Value::Null), &UnitContext::default());
        let err = result.into_result().unwrap_err();
        assert!(err.contains("kaboom"), "got: {err}");
    }

    #[test]
    fn execute_answers_garbage_with_failure_frame() {
        let frame = registry().execute(b"not json", &UnitContext::default());
        let result = ResultEnvelope::from_bytes(&frame).unwrap();
        assert!(!result.ok);
    }

    #[test]
    fn execute_round_trips_through_bytes() {
        let task = TaskEnvelope::new("double", json!(5)).to_bytes().unwrap();
        let frame = registry().execute(&task, &UnitContext::default());
        let result = ResultEnvelope::from_bytes(&frame).unwrap();
        assert_eq!(result.into_result(), Ok(json!(10)));
    }

    #[test]
    fn register_replaces_existing_name() {
        let reg = registry().with_fn("double", |_p, _c| Ok(json!("replaced")));
        assert_eq!(reg.len(), 3);
        let result = reg.run(TaskEnvelope::new("double", json!(1)), &UnitContext::default());
        assert_eq!(result.into_result(), Ok(json!("replaced")));
    }
}
