use crate::error::TaskError;
use crate::task::events::{EventHandler, Handlers, TaskEvent};
use crate::task::exec::{run_attempts, Queued, SchedCore};
use crate::task::types::{RetryBackoff, Task, TaskResult, TaskStatus};
use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Configuration for [`TaskQueue`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum tasks in flight at once.
    pub concurrency: usize,
    /// Timeout applied to tasks that do not set their own.
    pub default_timeout_ms: u64,
    /// Retry budget for tasks that do not set their own.
    pub default_retries: u32,
    /// When false, pending tasks dispatch in submission order only.
    pub enable_priority: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_timeout_ms: 30_000,
            default_retries: 0,
            enable_priority: true,
        }
    }
}

/// Snapshot of queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub concurrency: usize,
    pub paused: bool,
}

/// Dependency- and priority-aware asynchronous task queue.
///
/// Pending tasks dispatch in descending priority order (insertion order on
/// ties) whenever a concurrency slot is free and every declared dependency
/// holds a successful result. Each task races its work against a timeout and
/// retries immediately up to its budget. A task whose dependency failed is
/// never dispatched and leaves no result entry.
pub struct TaskQueue<T> {
    config: QueueConfig,
    state: Mutex<SchedCore<T>>,
    results: Arc<DashMap<String, TaskResult<T>>>,
    handlers: Handlers,
    notify: Notify,
}

impl<T: Clone + Send + 'static> TaskQueue<T> {
    /// Create a queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedCore::default()),
            results: Arc::new(DashMap::new()),
            handlers: Handlers::new(),
            notify: Notify::new(),
        }
    }

    /// Register a lifecycle event observer.
    pub fn add_event_handler(&self, handler: Box<dyn EventHandler>) {
        self.handlers.add(handler);
    }

    /// Submit a task. Fails synchronously on a duplicate id.
    pub fn add(&self, task: Task<T>) -> Result<(), TaskError> {
        let id = task.id.clone();
        {
            let mut state = self.lock_state();
            state.submit(task)?;
        }
        self.handlers.emit(&TaskEvent::TaskAdded { id: id.clone() });
        debug!("queued task {}", id);
        self.notify.notify_one();
        Ok(())
    }

    /// Submit several tasks, stopping at the first duplicate id.
    pub fn add_batch(&self, tasks: Vec<Task<T>>) -> Result<(), TaskError> {
        for task in tasks {
            self.add(task)?;
        }
        Ok(())
    }

    /// Resume dispatch after a [`pause`](Self::pause).
    pub fn start(&self) {
        self.lock_state().paused = false;
        self.notify.notify_one();
    }

    /// Stop dispatching new tasks. Running tasks are not cancelled.
    pub fn pause(&self) {
        self.lock_state().paused = true;
    }

    /// Drop all pending tasks and recorded results.
    pub fn clear(&self) {
        {
            let mut state = self.lock_state();
            state.clear(&self.results);
        }
        self.handlers.emit(&TaskEvent::Cleared);
        info!("task queue cleared");
    }

    /// The recorded result for a task, if it has completed.
    pub fn get_result(&self, id: &str) -> Option<TaskResult<T>> {
        self.results.get(id).map(|entry| entry.value().clone())
    }

    /// Current queue counters.
    pub fn get_status(&self) -> QueueStatus {
        let state = self.lock_state();
        QueueStatus {
            pending: state.pending.len(),
            running: state.running.len(),
            completed: self.results.len(),
            concurrency: self.config.concurrency,
            paused: state.paused,
        }
    }

    /// Drive the queue until pending is empty and nothing is running, then
    /// return all recorded results. Never fails: inspect each
    /// [`TaskResult::status`] for per-task outcomes. Tasks skipped over a
    /// failed dependency are absent from the map.
    pub async fn wait_all(&self) -> HashMap<String, TaskResult<T>> {
        let mut running: JoinSet<TaskResult<T>> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            self.dispatch_ready(&mut running, &mut inflight);

            if running.is_empty() {
                let (pending_left, paused) = {
                    let state = self.lock_state();
                    (state.pending.len(), state.paused)
                };
                if pending_left == 0 {
                    break;
                }
                if paused {
                    self.notify.notified().await;
                    continue;
                }
                // Nothing running and nothing eligible: the remaining
                // pending tasks are blocked on failed or unknown
                // dependencies, or form a cycle.
                let mut state = self.lock_state();
                if state.prune_blocked(&self.results).is_empty() {
                    state.drop_cycle();
                }
                continue;
            }

            tokio::select! {
                joined = running.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.absorb(joined, &mut inflight);
                    }
                }
                _ = self.notify.notified() => {}
            }
        }

        self.results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Move eligible pending tasks into the running set while slots remain.
    fn dispatch_ready(
        &self,
        running: &mut JoinSet<TaskResult<T>>,
        inflight: &mut HashMap<tokio::task::Id, String>,
    ) {
        let mut started = Vec::new();
        {
            let mut state = self.lock_state();
            if state.paused {
                return;
            }
            if self.config.enable_priority {
                state
                    .pending
                    .sort_by_key(|queued| (std::cmp::Reverse(queued.task.priority), queued.seq));
            }
            while state.running.len() < self.config.concurrency {
                let Some(index) = state.eligible_index(&self.results) else {
                    break;
                };
                let Queued { task, .. } = state.pending.remove(index);
                let id = task.id.clone();
                state.running.insert(id.clone());

                let timeout = task
                    .timeout
                    .unwrap_or(Duration::from_millis(self.config.default_timeout_ms));
                let retries = task.retries.unwrap_or(self.config.default_retries);
                let handle = running.spawn(run_attempts(
                    task,
                    timeout,
                    retries,
                    RetryBackoff::Immediate,
                    self.handlers.clone(),
                ));
                inflight.insert(handle.id(), id.clone());
                started.push(id);
            }
        }
        for id in started {
            self.handlers.emit(&TaskEvent::TaskStarted { id });
        }
    }

    /// Record a finished attempt chain (or a panicked task) as a terminal
    /// result and free its concurrency slot.
    fn absorb(
        &self,
        joined: Result<(tokio::task::Id, TaskResult<T>), tokio::task::JoinError>,
        inflight: &mut HashMap<tokio::task::Id, String>,
    ) {
        let result = match joined {
            Ok((join_id, result)) => {
                inflight.remove(&join_id);
                result
            }
            Err(join_error) => {
                error!("task panicked: {}", join_error);
                let id = inflight
                    .remove(&join_error.id())
                    .unwrap_or_else(|| "unknown".to_string());
                TaskResult::failure(
                    id,
                    TaskError::Failed(format!("task panicked: {join_error}")),
                    Duration::ZERO,
                    0,
                )
            }
        };
        self.record(result);
    }

    fn record(&self, result: TaskResult<T>) {
        {
            let mut state = self.lock_state();
            state.running.remove(&result.id);
        }
        let event = match result.status {
            TaskStatus::Success => TaskEvent::TaskCompleted {
                id: result.id.clone(),
                duration_ms: result.duration.as_millis() as u64,
            },
            TaskStatus::Failure => TaskEvent::TaskFailed {
                id: result.id.clone(),
                error: result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            },
        };
        // Results are terminal; never overwrite an existing entry.
        self.results.entry(result.id.clone()).or_insert(result);
        self.handlers.emit(&event);
        self.notify.notify_one();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedCore<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
