//! taskpool: run built-in handlers on a worker pool from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};

use taskpool::config::load_dotenv;
use taskpool::{builtin, Pool, PoolConfig, ProcessSpawner, ThreadSpawner, UnitSpawner};

/// Dispatch tasks onto a fixed set of background worker units.
#[derive(Parser, Debug)]
#[command(name = "taskpool", version, about)]
struct Cli {
    /// Path to a taskpool.toml config file.
    #[arg(long, env = "TASKPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Number of worker units (overrides the config; 0 = available parallelism).
    #[arg(long)]
    units: Option<usize>,

    /// Run units as child processes instead of threads.
    #[arg(long)]
    process: bool,

    /// Print pool statistics to stderr before exiting.
    #[arg(long)]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task and print its result.
    Run {
        /// Handler name (echo, sleep, fail, sum, panic).
        function: String,

        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,

        /// Progress label.
        #[arg(long, default_value = "running task")]
        label: String,
    },
    /// Run one task per item and print every result.
    Batch {
        /// Handler name.
        function: String,

        /// JSON item; repeat for more items.
        #[arg(long = "item", required = true)]
        items: Vec<String>,

        /// JSON object merged into every item's payload.
        #[arg(long, default_value = "{}")]
        shared: String,

        /// Progress label.
        #[arg(long, default_value = "running batch")]
        label: String,
    },
}

fn parse_json(what: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("{what} is not valid JSON: {text}"))
}

fn load_config(cli: &Cli) -> Result<PoolConfig> {
    let mut config = match &cli.config {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => PoolConfig::from_env().context("invalid TASKPOOL_* environment")?,
    };
    if let Some(units) = cli.units {
        config.units = units;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    debug!(?config, "resolved pool config");

    let spawner: Box<dyn UnitSpawner> = if cli.process {
        Box::new(ProcessSpawner::from_config(&config)?)
    } else {
        Box::new(ThreadSpawner::new(builtin::registry()))
    };
    let pool = Pool::from_config(&config, spawner.as_ref())
        .await
        .context("failed to start worker pool")?;

    let outcome = match &cli.command {
        Command::Run {
            function,
            payload,
            label,
        } => {
            let payload = parse_json("payload", payload)?;
            pool.run(label, function, payload).await.map(|value| {
                println!("{value}");
            })
        }
        Command::Batch {
            function,
            items,
            shared,
            label,
        } => {
            let items = items
                .iter()
                .map(|item| parse_json("item", item))
                .collect::<Result<Vec<_>>>()?;
            let shared = parse_json("shared payload", shared)?;

            info!(task = %label, items = items.len(), "submitting batch");
            let results = pool.collect_batch(function, items, shared).await?;
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(value) => println!("{value}"),
                    Err(e) => {
                        eprintln!("error: {e}");
                        first_error.get_or_insert(e);
                    }
                }
            }
            first_error.map_or(Ok(()), Err)
        }
    };

    if cli.stats {
        let stats = pool.stats().await?;
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }
    pool.terminate().await;

    outcome.context("task failed")
}
