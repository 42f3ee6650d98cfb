use thiserror::Error;

/// Errors produced by the task pool and its worker units.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unit {unit_id} failed to start: {reason}")]
    Construction { unit_id: usize, reason: String },

    #[error("task {function_name} failed: {message}")]
    TaskFailed {
        function_name: String,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unit {unit_id} was lost")]
    UnitLost { unit_id: usize },

    #[error("no live units remain")]
    NoLiveUnits,

    #[error("pool terminated")]
    Terminated,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Whether the error only affects the task it was reported for.
    ///
    /// Task-local errors leave the unit in rotation; everything else means
    /// the pool or a unit is no longer usable.
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            PoolError::TaskFailed { .. }
                | PoolError::Protocol(_)
                | PoolError::Serialization(_)
                | PoolError::InvalidPayload(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_local_classification() {
        let failed = PoolError::TaskFailed {
            function_name: "compile".into(),
            message: "syntax error".into(),
        };
        assert!(failed.is_task_local());
        assert!(PoolError::Protocol("bad frame".into()).is_task_local());
        assert!(!PoolError::UnitLost { unit_id: 1 }.is_task_local());
        assert!(!PoolError::Terminated.is_task_local());
    }

    #[test]
    fn display_includes_function_name() {
        let err = PoolError::TaskFailed {
            function_name: "bundle".into(),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "task bundle failed: boom");
    }
}
