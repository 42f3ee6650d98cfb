use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, UnitConfig};
use crate::error::PoolError;

use super::{UnitSpawner, WorkerUnit};

/// Environment variable carrying the unit id to the child process.
pub const UNIT_ID_ENV: &str = "TASKPOOL_UNIT_ID";
/// Environment variable carrying the JSON-encoded [`UnitConfig`] to the child process.
pub const UNIT_CONFIG_ENV: &str = "TASKPOOL_UNIT_CONFIG";

/// How long `terminate` waits for the child to exit after killing it.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A worker unit running as a child process with its own memory space.
///
/// Each envelope travels as one line of JSON: tasks on the child's stdin,
/// results on its stdout. The child's stderr is inherited for logging.
pub struct ProcessUnit {
    id: usize,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
}

impl ProcessUnit {
    /// Spawn the unit host process.
    pub fn start(
        id: usize,
        program: &Path,
        args: &[String],
        config: &UnitConfig,
    ) -> Result<Self, PoolError> {
        let construction = |reason: String| PoolError::Construction { unit_id: id, reason };

        let config_json = serde_json::to_string(config)?;
        let mut child = Command::new(program)
            .args(args)
            .env(UNIT_ID_ENV, id.to_string())
            .env(UNIT_CONFIG_ENV, config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| construction(format!("failed to spawn {}: {e}", program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| construction("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| construction("child stdout not captured".into()))?;

        debug!(unit_id = id, pid = ?child.id(), program = %program.display(), "process unit spawned");

        Ok(Self {
            id,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
        })
    }
}

#[async_trait]
impl WorkerUnit for ProcessUnit {
    fn id(&self) -> usize {
        self.id
    }

    async fn send(&self, mut frame: Vec<u8>) -> Result<(), PoolError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(PoolError::UnitLost { unit_id: self.id })?;

        frame.push(b'\n');
        let written = async {
            pipe.write_all(&frame).await?;
            pipe.flush().await
        }
        .await;

        written.map_err(|e| {
            warn!(unit_id = self.id, error = %e, "failed to write task to unit");
            PoolError::UnitLost { unit_id: self.id }
        })
    }

    async fn next_result(&self) -> Option<Vec<u8>> {
        let mut stdout = self.stdout.lock().await;
        let mut line = String::new();
        match stdout.read_line(&mut line).await {
            Ok(0) => {
                debug!(unit_id = self.id, "unit closed its stdout");
                None
            }
            Ok(_) => Some(line.trim_end().as_bytes().to_vec()),
            Err(e) => {
                warn!(unit_id = self.id, error = %e, "failed to read result from unit");
                None
            }
        }
    }

    async fn terminate(&self) {
        // Dropping stdin lets a well-behaved host exit on EOF; the kill covers the rest.
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(unit_id = self.id, error = %e, "unit already exited");
        }
        match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(unit_id = self.id, %status, "process unit exited"),
            Ok(Err(e)) => warn!(unit_id = self.id, error = %e, "failed to reap process unit"),
            Err(_) => warn!(unit_id = self.id, timeout = ?KILL_TIMEOUT, "process unit did not exit in time"),
        }
    }
}

/// Spawns [`ProcessUnit`]s running the same unit host executable.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Build a spawner from the `[process]` section of a pool config.
    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        let program = config.resolved_program()?;
        info!(program = %program.display(), "using process units");
        Ok(Self::new(program).with_args(config.process.args.clone()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl UnitSpawner for ProcessSpawner {
    async fn spawn(&self, id: usize, config: &UnitConfig) -> Result<Arc<dyn WorkerUnit>, PoolError> {
        let unit = ProcessUnit::start(id, &self.program, &self.args, config)?;
        Ok(Arc::new(unit))
    }
}
