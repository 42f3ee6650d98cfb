//! Built-in handlers shipped with the bundled binaries.
//!
//! Handlers read batch items from the `element` key, so each of them works
//! both with [`Pool::submit`](crate::Pool::submit) and with
//! [`Pool::submit_batch`](crate::Pool::submit_batch).

use std::time::Duration;

use serde_json::{json, Value};

use crate::handler::{HandlerError, HandlerRegistry, UnitContext};
use crate::scheduler::BATCH_ELEMENT_KEY;

/// Registry holding every built-in handler.
pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_fn("echo", echo)
        .with_fn("sleep", sleep)
        .with_fn("fail", fail)
        .with_fn("sum", sum)
        .with_fn("panic", |_payload, _ctx| panic!("panic requested"))
}

/// Look up `key`, falling back to the batch element.
fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get(key).or_else(|| payload.get(BATCH_ELEMENT_KEY))
}

/// Return the payload unchanged.
fn echo(payload: Value, _ctx: &UnitContext) -> Result<Value, HandlerError> {
    Ok(payload)
}

/// Block the unit for `ms` milliseconds.
fn sleep(payload: Value, ctx: &UnitContext) -> Result<Value, HandlerError> {
    let ms = field(&payload, "ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| HandlerError::InvalidPayload("expected {\"ms\": <integer>}".into()))?;
    std::thread::sleep(Duration::from_millis(ms));
    Ok(json!({ "unit": ctx.unit_id, "slept_ms": ms }))
}

/// Always fail with the given message.
fn fail(payload: Value, _ctx: &UnitContext) -> Result<Value, HandlerError> {
    let message = field(&payload, "message")
        .and_then(Value::as_str)
        .unwrap_or("failure requested");
    Err(HandlerError::Failed(message.to_string()))
}

/// Add up a number or an array of numbers.
fn sum(payload: Value, _ctx: &UnitContext) -> Result<Value, HandlerError> {
    let input = field(&payload, "numbers")
        .ok_or_else(|| HandlerError::InvalidPayload("expected numbers".into()))?;
    let total = match input {
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => items
            .iter()
            .map(Value::as_f64)
            .sum::<Option<f64>>(),
        _ => None,
    }
    .ok_or_else(|| HandlerError::InvalidPayload("numbers must be numeric".into()))?;
    Ok(json!(total))
}
