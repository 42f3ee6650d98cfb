//! Child-process side of [`ProcessUnit`](super::ProcessUnit).
//!
//! The host reads one task envelope per stdin line and answers each with one
//! result envelope on stdout. It exits cleanly when stdin reaches EOF, which
//! is how the pool signals shutdown short of killing the process.

use std::io::{self, BufRead, Write};

use tracing::{debug, info};

use crate::config::UnitConfig;
use crate::error::PoolError;
use crate::handler::{HandlerRegistry, UnitContext};

use super::process::{UNIT_CONFIG_ENV, UNIT_ID_ENV};

/// Build the unit context from the environment the pool set up.
pub fn context_from_env() -> Result<UnitContext, PoolError> {
    let unit_id = match std::env::var(UNIT_ID_ENV) {
        Ok(v) => v
            .parse()
            .map_err(|_| PoolError::Config(format!("{UNIT_ID_ENV} is not a number: {v}")))?,
        Err(_) => 0,
    };
    let config = match std::env::var(UNIT_CONFIG_ENV) {
        Ok(v) => serde_json::from_str(&v)?,
        Err(_) => UnitConfig::default(),
    };
    Ok(UnitContext::new(unit_id, config))
}

/// Run the unit host loop on stdin/stdout until EOF.
pub fn run_unit_host(registry: &HandlerRegistry) -> Result<(), PoolError> {
    let ctx = context_from_env()?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(registry, &ctx, stdin.lock(), stdout.lock())
}

/// Serve tasks from `input`, writing results to `output`.
pub fn serve<R: BufRead, W: Write>(
    registry: &HandlerRegistry,
    ctx: &UnitContext,
    input: R,
    mut output: W,
) -> Result<(), PoolError> {
    info!(unit_id = ctx.unit_id, handlers = registry.len(), "unit host ready");

    let mut served = 0usize;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let result = registry.execute(line.as_bytes(), ctx);
        output.write_all(&result)?;
        output.write_all(b"\n")?;
        output.flush()?;
        served += 1;
    }

    debug!(unit_id = ctx.unit_id, served, "unit host input closed");
    Ok(())
}
