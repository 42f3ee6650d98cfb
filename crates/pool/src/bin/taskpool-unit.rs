//! taskpool-unit: process-unit host running the built-in handlers.
//!
//! Spawned by the pool with piped stdin/stdout: one task envelope per input
//! line, one result envelope per output line. Logs go to stderr.

use anyhow::Context;
use clap::Parser;
use tracing::info;

use taskpool::{builtin, run_unit_host};

/// Worker unit host for taskpool process units.
#[derive(Parser, Debug)]
#[command(name = "taskpool-unit", version, about)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "TASKPOOL_UNIT_LOG", default_value = "warn")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let registry = builtin::registry();
    run_unit_host(&registry).context("unit host failed")?;

    info!("unit host exiting");
    Ok(())
}
