use crate::error::TaskError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// An opaque asynchronous unit of work.
///
/// Schedulers only ever call [`Runnable::run`]; they never inspect the
/// payload. Retries invoke `run` again on the same value, so implementations
/// must be safe to execute more than once.
#[async_trait]
pub trait Runnable<T>: Send + Sync {
    async fn run(&self) -> Result<T>;
}

/// Adapter turning a plain async closure into a [`Runnable`].
struct FnRunnable<F> {
    f: F,
}

#[async_trait]
impl<T, F, Fut> Runnable<T> for FnRunnable<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    async fn run(&self) -> Result<T> {
        (self.f)().await
    }
}

/// A named, schedulable unit of work with priority, timeout, retry and
/// dependency metadata. Immutable once submitted.
pub struct Task<T> {
    pub id: String,
    pub(crate) work: Arc<dyn Runnable<T>>,
    /// Higher runs first. Default 0.
    pub priority: i32,
    /// Per-task timeout; falls back to the scheduler default when `None`.
    pub timeout: Option<Duration>,
    /// Retry budget beyond the first attempt; scheduler default when `None`.
    pub retries: Option<u32>,
    /// Ids of tasks that must complete successfully before this one runs.
    pub dependencies: Vec<String>,
}

impl<T: Send + 'static> Task<T> {
    /// Create a task from an async closure.
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::from_runnable(id, FnRunnable { f: work })
    }

    /// Create a task from any [`Runnable`] implementation.
    pub fn from_runnable(id: impl Into<String>, work: impl Runnable<T> + 'static) -> Self {
        Self {
            id: id.into(),
            work: Arc::new(work),
            priority: 0,
            timeout: None,
            retries: None,
            dependencies: Vec::new(),
        }
    }

    /// Set the scheduling priority (higher runs first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a per-task timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry budget beyond the first attempt.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Declare dependency task ids that must succeed first.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            work: Arc::clone(&self.work),
            priority: self.priority,
            timeout: self.timeout,
            retries: self.retries,
            dependencies: self.dependencies.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Success,
    Failure,
}

/// The recorded outcome of one task. Terminal; never overwritten.
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    pub id: String,
    pub status: TaskStatus,
    pub data: Option<T>,
    pub error: Option<TaskError>,
    /// Elapsed wall time across all attempts.
    pub duration: Duration,
    /// Attempts beyond the first.
    pub retry_count: u32,
    pub completed_at: DateTime<Utc>,
}

impl<T> TaskResult<T> {
    pub(crate) fn success(id: String, data: T, duration: Duration, retry_count: u32) -> Self {
        Self {
            id,
            status: TaskStatus::Success,
            data: Some(data),
            error: None,
            duration,
            retry_count,
            completed_at: Utc::now(),
        }
    }

    pub(crate) fn failure(
        id: String,
        error: TaskError,
        duration: Duration,
        retry_count: u32,
    ) -> Self {
        Self {
            id,
            status: TaskStatus::Failure,
            data: None,
            error: Some(error),
            duration,
            retry_count,
            completed_at: Utc::now(),
        }
    }

    /// Whether the task completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Delay policy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    /// Re-attempt immediately.
    Immediate,
    /// `min(base_ms * 2^retry_index, cap_ms)` milliseconds.
    Exponential { base_ms: u64, cap_ms: u64 },
}

impl RetryBackoff {
    /// Delay before the given retry, counting from 0.
    pub fn delay(&self, retry_index: u32) -> Option<Duration> {
        match *self {
            RetryBackoff::Immediate => None,
            RetryBackoff::Exponential { base_ms, cap_ms } => {
                let shift = retry_index.min(20);
                let ms = base_ms.saturating_mul(1u64 << shift).min(cap_ms);
                Some(Duration::from_millis(ms))
            }
        }
    }
}

/// Aggregate counters for one scheduler instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Exponential moving average over terminal task durations.
    pub avg_duration_ms: f64,
    /// Completed tasks per second since the scheduler was created.
    pub throughput: f64,
}

impl PerformanceMetrics {
    /// Fraction of terminal tasks that succeeded; 1.0 when nothing ran yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            1.0
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_builder_defaults() {
        let task: Task<u32> = Task::new("format-esm", || async { Ok(1) });

        assert_eq!(task.id, "format-esm");
        assert_eq!(task.priority, 0);
        assert_eq!(task.timeout, None);
        assert_eq!(task.retries, None);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_task_builder_chaining() {
        let task: Task<()> = Task::new("dts-generate", || async { Ok(()) })
            .with_priority(5)
            .with_timeout(Duration::from_secs(10))
            .with_retries(2)
            .with_dependencies(vec!["format-esm".to_string()]);

        assert_eq!(task.priority, 5);
        assert_eq!(task.timeout, Some(Duration::from_secs(10)));
        assert_eq!(task.retries, Some(2));
        assert_eq!(task.dependencies, vec!["format-esm".to_string()]);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = RetryBackoff::Exponential {
            base_ms: 1000,
            cap_ms: 10_000,
        };

        assert_eq!(backoff.delay(0), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(2000)));
        assert_eq!(backoff.delay(2), Some(Duration::from_millis(4000)));
        assert_eq!(backoff.delay(10), Some(Duration::from_millis(10_000)));
        assert_eq!(RetryBackoff::Immediate.delay(3), None);
    }

    #[test]
    fn test_metrics_success_rate() {
        let mut metrics = PerformanceMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.total_tasks = 4;
        metrics.successful_tasks = 3;
        metrics.failed_tasks = 1;
        assert_eq!(metrics.success_rate(), 0.75);
    }
}
