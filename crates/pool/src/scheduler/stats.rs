use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of pool state and counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Units the pool was built with.
    pub unit_count: usize,
    /// Units currently running a task.
    pub busy_units: usize,
    /// Units lost and taken out of rotation.
    pub retired_units: usize,
    /// Requests waiting for an idle unit.
    pub queued: usize,
    /// Tasks that resolved with a value.
    pub completed: u64,
    /// Tasks rejected with a task-local error.
    pub failed: u64,
    /// Tasks whose unit was lost while they ran.
    pub lost: u64,
    /// Per-function execution figures.
    pub functions: HashMap<String, FunctionStats>,
}

/// Execution figures for one function name.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionStats {
    /// Tasks settled, successful or not.
    pub executed: u64,
    /// Tasks that settled with an error.
    pub failed: u64,
    /// Rolling average of dispatch-to-settle time.
    pub avg_duration: Duration,
    /// When a task for this function last settled.
    pub last_run: DateTime<Utc>,
}

impl PoolStats {
    /// Tasks settled in any way.
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.lost
    }

    /// Record a settled task.
    pub fn record_execution(&mut self, function_name: &str, duration: Duration, succeeded: bool) {
        let entry = self
            .functions
            .entry(function_name.to_string())
            .or_insert_with(|| FunctionStats {
                executed: 0,
                failed: 0,
                avg_duration: Duration::ZERO,
                last_run: Utc::now(),
            });

        entry.executed += 1;
        if !succeeded {
            entry.failed += 1;
        }
        entry.last_run = Utc::now();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        entry.avg_duration = if entry.executed == 1 {
            duration
        } else {
            let prev_nanos = entry.avg_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / entry.executed as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}
