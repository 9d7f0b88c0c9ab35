use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the scheduling engine.
///
/// Individual task failures are captured into [`crate::task::TaskResult`]
/// entries rather than propagated; these variants surface either inside a
/// result or from the single-unit worker-pool API.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The work unit itself returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The work unit exceeded its configured timeout. The underlying work
    /// may still be running in the background and must be assumed leaked.
    #[error("task '{id}' timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    /// A declared dependency finished with a failure, so this task was
    /// never attempted.
    #[error("task '{id}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { id: String, dependency: String },

    /// A pool worker thread exited or panicked independent of any specific
    /// task outcome.
    #[error("worker {worker_id} crashed: {reason}")]
    WorkerCrashed { worker_id: Uuid, reason: String },

    /// Work was submitted to a pool after `terminate()`.
    #[error("worker pool is terminated")]
    Terminated,

    /// A task id was submitted twice to the same scheduler instance.
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
}

impl TaskError {
    /// Whether this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }

    /// Whether this error represents a worker crash.
    pub fn is_worker_crash(&self) -> bool {
        matches!(self, TaskError::WorkerCrashed { .. })
    }

    /// Whether this error was caused by pool termination.
    pub fn is_terminated(&self) -> bool {
        matches!(self, TaskError::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_helpers() {
        let timeout = TaskError::Timeout {
            id: "build-esm".to_string(),
            timeout_ms: 50,
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_terminated());

        let crash = TaskError::WorkerCrashed {
            worker_id: Uuid::new_v4(),
            reason: "panicked".to_string(),
        };
        assert!(crash.is_worker_crash());

        assert!(TaskError::Terminated.is_terminated());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = TaskError::Timeout {
            id: "dts-generate".to_string(),
            timeout_ms: 30_000,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("dts-generate"));
        assert!(rendered.contains("30000"));
    }
}
