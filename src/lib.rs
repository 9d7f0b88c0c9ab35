//! # Taskforge
//!
//! A parallel task scheduling and execution engine for build-style
//! workloads: async queues with priorities and dependency edges, an
//! adaptive scheduler that tunes its concurrency from live resource
//! pressure, a self-healing OS-thread pool for CPU-bound work, and a
//! build-graph orchestrator layered on the same primitives.
//!
//! ## Architecture Overview
//!
//! The engine consists of four components organized into modules:
//!
//! - **[`task::queue`]**: Priority- and dependency-aware async task queue
//!   with per-task timeout and retry budgets
//! - **[`task::processor`]**: Superset scheduler adding history-weighted
//!   reordering and adaptive concurrency control
//! - **[`worker`]**: Fixed-size pool of real OS threads with FIFO
//!   overflow queueing and crash recovery
//! - **[`build`]**: Build-domain façade modelling one build as a DAG of
//!   typed tasks under a global concurrency cap
//!
//! ## Features
//!
//! ### Scheduling
//! - **Priority dispatch**: Higher-priority pending tasks start first;
//!   ties keep submission order
//! - **Dependency gating**: A task runs only once every dependency holds
//!   a successful result; failed dependencies skip dependents
//! - **Timeouts and retries**: Every attempt races a timeout; retry
//!   budgets re-run the work with immediate or exponential backoff
//!
//! ### Adaptive Control
//! - **Resource sampling**: Memory and load probes feed a control loop
//!   that steps the concurrency limit up or down within bounds
//! - **Task history**: Per-type moving averages of duration and success
//!   rate re-rank pending work
//!
//! ### Resilience
//! - **Self-healing workers**: A crashed or stuck worker thread is
//!   replaced without losing queued work
//! - **Captured failures**: Batch APIs never throw for a task's own
//!   failure; callers inspect per-task results
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskforge::{QueueConfig, Task, TaskQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = TaskQueue::new(QueueConfig::default());
//!
//!     queue.add(Task::new("format-esm", || async { Ok("dist/index.mjs".to_string()) }))?;
//!     queue.add(
//!         Task::new("minify-esm", || async { Ok("dist/index.min.mjs".to_string()) })
//!             .with_dependencies(vec!["format-esm".to_string()]),
//!     )?;
//!
//!     let results = queue.wait_all().await;
//!     println!("{} tasks finished", results.len());
//!     Ok(())
//! }
//! ```

/// Error taxonomy shared by all schedulers.
pub mod error;

/// Host resource sampling for the adaptive control loop.
pub mod system;

/// Cooperative async schedulers: queue, processor, events, task types.
pub mod task;

/// OS-thread worker pool for CPU-bound work.
pub mod worker;

/// Build-graph orchestration over the task primitives.
pub mod build;

// Re-export the main scheduling types
pub use error::TaskError;
pub use task::events::{EventHandler, LoggingEventHandler, TaskEvent};
pub use task::processor::{ParallelProcessor, ProcessorConfig, ProcessorStatus, TypeHistory};
pub use task::queue::{QueueConfig, QueueStatus, TaskQueue};
pub use task::types::{
    PerformanceMetrics, RetryBackoff, Runnable, Task, TaskResult, TaskStatus,
};

// Re-export the worker pool types
pub use worker::{PoolConfig, PoolStatus, WorkerPool, WorkerTask};

// Re-export the build orchestrator types
pub use build::{BuildConfig, BuildTaskKind, ParallelBuildManager};

/// Run a set of futures concurrently, rethrowing the first error.
///
/// Convenience wrapper for callers that want fail-fast semantics instead
/// of the per-task result capture the schedulers provide.
pub async fn parallel<T, I, Fut>(futures: I) -> anyhow::Result<Vec<T>>
where
    I: IntoIterator<Item = Fut>,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    futures::future::try_join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parallel_collects_in_order() {
        let values = parallel((1..=3).map(|n| async move { Ok(n * 10) }))
            .await
            .unwrap();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_parallel_rethrows_first_error() {
        let futures = vec![
            futures::future::ready(Ok(1)),
            futures::future::ready(Err(anyhow::anyhow!("boom"))),
        ];
        let err = parallel(futures).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
