use crate::task::types::PerformanceMetrics;
use anyhow::Result;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle events emitted by the schedulers and the worker pool.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskAdded {
        id: String,
    },
    TaskStarted {
        id: String,
    },
    TaskCompleted {
        id: String,
        duration_ms: u64,
    },
    TaskFailed {
        id: String,
        error: String,
    },
    TaskRetry {
        id: String,
        attempt: u32,
    },
    TaskTimeout {
        id: String,
        timeout_ms: u64,
    },
    Cleared,
    ConcurrencyAdjusted {
        old: usize,
        new: usize,
        reason: String,
    },
    MetricsUpdated {
        metrics: PerformanceMetrics,
    },
    WorkerCrashed {
        worker_id: Uuid,
        reason: String,
    },
    WorkerReplaced {
        worker_id: Uuid,
        replacement_id: Uuid,
    },
}

/// Observer for scheduler lifecycle events.
///
/// Handlers run inline on the scheduler's control flow and must not block.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &TaskEvent) -> Result<()>;
}

/// Shared handler registry. Cloning shares the underlying set.
#[derive(Clone, Default)]
pub struct Handlers {
    inner: Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn add(&self, handler: Box<dyn EventHandler>) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// Deliver an event to every registered handler. Handler errors are
    /// logged and never interrupt scheduling.
    pub(crate) fn emit(&self, event: &TaskEvent) {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handler in guard.iter() {
            if let Err(e) = handler.handle_event(event) {
                error!("event handler error: {}", e);
            }
        }
    }
}

/// Built-in handler that forwards events to `tracing`.
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()> {
        match event {
            TaskEvent::TaskAdded { id } => debug!("task added: {}", id),
            TaskEvent::TaskStarted { id } => debug!("task started: {}", id),
            TaskEvent::TaskCompleted { id, duration_ms } => {
                info!("task completed: {} in {}ms", id, duration_ms);
            }
            TaskEvent::TaskFailed { id, error } => warn!("task failed: {} - {}", id, error),
            TaskEvent::TaskRetry { id, attempt } => {
                info!("task retry: {} (attempt {})", id, attempt);
            }
            TaskEvent::TaskTimeout { id, timeout_ms } => {
                warn!("task timed out: {} after {}ms", id, timeout_ms);
            }
            TaskEvent::Cleared => debug!("queue cleared"),
            TaskEvent::ConcurrencyAdjusted { old, new, reason } => {
                info!("concurrency adjusted {} -> {}: {}", old, new, reason);
            }
            TaskEvent::MetricsUpdated { metrics } => {
                debug!(
                    "metrics: {} total, {:.1}% success, {:.0}ms avg",
                    metrics.total_tasks,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration_ms
                );
            }
            TaskEvent::WorkerCrashed { worker_id, reason } => {
                warn!("worker {} crashed: {}", worker_id, reason);
            }
            TaskEvent::WorkerReplaced {
                worker_id,
                replacement_id,
            } => {
                info!("worker {} replaced by {}", worker_id, replacement_id);
            }
        }
        Ok(())
    }
}
