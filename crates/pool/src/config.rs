use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PoolError;

/// Upper bound on configured units; anything larger is almost certainly a typo.
pub const MAX_UNITS: usize = 1024;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

// ── Top-level config ──────────────────────────────────────────

/// Pool configuration, typically parsed from `taskpool.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker units. 0 = available parallelism.
    #[serde(default)]
    pub units: usize,

    /// Settings handed to every unit at startup.
    #[serde(default)]
    pub unit: UnitConfig,

    /// Child-process unit settings.
    #[serde(default)]
    pub process: ProcessConfig,
}

/// Per-unit startup settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Total unit count of the owning pool. Filled in by the pool at construction.
    #[serde(default)]
    pub threads: usize,

    /// Scratch directory units may write intermediate output to.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Cache directory shared by all units.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

/// Settings for units that run as child processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unit host executable. Defaults to `taskpool-unit` next to the current executable.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Extra arguments passed to the unit host.
    #[serde(default)]
    pub args: Vec<String>,
}

impl PoolConfig {
    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        Self::from_toml_with(toml_str, env_opt)
    }

    /// Parse config from a TOML string, taking overrides from `lookup`.
    pub fn from_toml_with(
        toml_str: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PoolError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_overrides_from(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        Self::from_file_with(path, env_opt)
    }

    /// Load config from a file path, taking overrides from `lookup`.
    pub fn from_file_with(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PoolError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading pool config");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with(&content, lookup)
    }

    /// Build config from defaults plus environment variables only.
    pub fn from_env() -> Result<Self, PoolError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TASKPOOL_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(env_opt);
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(units) = lookup("TASKPOOL_UNITS").and_then(|v| v.parse().ok()) {
            self.units = units;
        }
        if let Some(dir) = lookup("TASKPOOL_TEMP_DIR") {
            self.unit.temp_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("TASKPOOL_CACHE_DIR") {
            self.unit.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(program) = lookup("TASKPOOL_UNIT_PROGRAM") {
            self.process.program = Some(PathBuf::from(program));
        }
    }

    /// Check the config for values the pool cannot work with.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.units > MAX_UNITS {
            return Err(PoolError::Config(format!(
                "units = {} exceeds the maximum of {}",
                self.units, MAX_UNITS
            )));
        }
        if self.process.program.is_none() && !self.process.args.is_empty() {
            return Err(PoolError::Config(
                "process.args is set but process.program is not".into(),
            ));
        }
        Ok(())
    }

    /// Resolve unit count (0 means use available parallelism).
    pub fn resolved_units(&self) -> usize {
        if self.units == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.units
        }
    }

    /// Resolve the unit host executable for process units.
    pub fn resolved_program(&self) -> Result<PathBuf, PoolError> {
        if let Some(program) = &self.process.program {
            return Ok(program.clone());
        }
        let exe = env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| PoolError::Config("current executable has no parent dir".into()))?;
        Ok(dir.join(format!("taskpool-unit{}", env::consts::EXE_SUFFIX)))
    }
}
