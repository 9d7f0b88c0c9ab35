//! Build-pipeline orchestration over the task primitives.
//!
//! [`ParallelBuildManager`] models one build as a DAG of typed tasks
//! (format emission, declaration generation, minification, analysis) and
//! runs it under a global concurrency cap. Unlike the generic queue, a
//! task whose dependency has not finished yet is requeued rather than
//! dropped, so the graph makes forward progress as results land.

use crate::error::TaskError;
use crate::task::events::{EventHandler, Handlers, TaskEvent};
use crate::task::exec::run_attempts;
use crate::task::types::{RetryBackoff, Task, TaskResult};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The build task categories, each with a fixed dispatch priority.
/// Format emission outranks everything; declaration generation runs last
/// among equals since its consumers only need it at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildTaskKind {
    Format,
    Minify,
    Analyze,
    Dts,
}

impl BuildTaskKind {
    pub fn priority(self) -> i32 {
        match self {
            BuildTaskKind::Format => 10,
            BuildTaskKind::Minify => 8,
            BuildTaskKind::Analyze => 5,
            BuildTaskKind::Dts => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildTaskKind::Format => "format",
            BuildTaskKind::Minify => "minify",
            BuildTaskKind::Analyze => "analyze",
            BuildTaskKind::Dts => "dts",
        }
    }
}

/// Configuration for [`ParallelBuildManager`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Maximum build tasks in flight at once.
    pub concurrency: usize,
    /// Shared timeout raced against every task.
    pub task_timeout_ms: u64,
    /// When true (the default), a failing task does not abort its
    /// siblings; when false the first failure halts dispatch and
    /// `execute` returns an error.
    pub continue_on_error: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout_ms: 30_000,
            continue_on_error: true,
        }
    }
}

/// Orchestrates one build run: register tasks, then [`execute`].
///
/// [`execute`]: ParallelBuildManager::execute
pub struct ParallelBuildManager<T> {
    config: BuildConfig,
    tasks: Vec<Task<T>>,
    /// Every id registered on this manager; enforces id uniqueness.
    seen: HashSet<String>,
    handlers: Handlers,
}

impl<T: Clone + Send + 'static> ParallelBuildManager<T> {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            seen: HashSet::new(),
            handlers: Handlers::new(),
        }
    }

    /// Register a lifecycle event observer.
    pub fn add_event_handler(&self, handler: Box<dyn EventHandler>) {
        self.handlers.add(handler);
    }

    /// Register one output-format build per format name, all sharing the
    /// same build function. Task ids take the shape `format-<name>`.
    /// Fails synchronously on a duplicate id.
    pub fn add_format_tasks<F, Fut>(
        &mut self,
        formats: &[String],
        build_fn: F,
    ) -> Result<(), TaskError>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let build_fn = Arc::new(build_fn);
        for format in formats {
            let format = format.clone();
            let build_fn = Arc::clone(&build_fn);
            let id = format!("format-{format}");
            self.push(
                BuildTaskKind::Format,
                Task::new(id, move || {
                    let build_fn = Arc::clone(&build_fn);
                    let format = format.clone();
                    async move { build_fn(format).await }
                }),
            )?;
        }
        Ok(())
    }

    /// Register the type-declaration generation task (`dts-generate`)
    /// over the given entry directories.
    pub fn add_dts_task<F, Fut>(
        &mut self,
        dirs: Vec<String>,
        generate_fn: F,
    ) -> Result<(), TaskError>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let generate_fn = Arc::new(generate_fn);
        self.push(
            BuildTaskKind::Dts,
            Task::new("dts-generate", move || {
                let generate_fn = Arc::clone(&generate_fn);
                let dirs = dirs.clone();
                async move { generate_fn(dirs).await }
            }),
        )
    }

    /// Register a minification task. The id takes the shape
    /// `minify-<name>`.
    pub fn add_minify_task<F, Fut>(&mut self, name: &str, work: F) -> Result<(), TaskError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.push(
            BuildTaskKind::Minify,
            Task::new(format!("minify-{name}"), work),
        )
    }

    /// Register a bundle-analysis task. The id takes the shape
    /// `analyze-<name>`.
    pub fn add_analyze_task<F, Fut>(&mut self, name: &str, work: F) -> Result<(), TaskError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.push(
            BuildTaskKind::Analyze,
            Task::new(format!("analyze-{name}"), work),
        )
    }

    /// Register an arbitrary task under a kind's priority. Dependencies
    /// declared on the task gate its dispatch during [`execute`].
    ///
    /// [`execute`]: ParallelBuildManager::execute
    pub fn add_task(&mut self, kind: BuildTaskKind, task: Task<T>) -> Result<(), TaskError> {
        self.push(kind, task)
    }

    fn push(&mut self, kind: BuildTaskKind, task: Task<T>) -> Result<(), TaskError> {
        if !self.seen.insert(task.id.clone()) {
            return Err(TaskError::DuplicateTask(task.id));
        }
        let task = task.with_priority(kind.priority());
        debug!("registered {} build task {}", kind.as_str(), task.id);
        self.handlers.emit(&TaskEvent::TaskAdded {
            id: task.id.clone(),
        });
        self.tasks.push(task);
        Ok(())
    }

    /// Run every registered task to completion and return the result map.
    ///
    /// Task failures and timeouts are captured into failure results; the
    /// returned `Err` is reserved for `continue_on_error = false` (first
    /// failure halts dispatch) so callers normally inspect per-task
    /// status. Tasks whose dependency failed, or names an id never
    /// registered, are recorded as failures without being invoked.
    pub async fn execute(&mut self) -> Result<HashMap<String, TaskResult<T>>> {
        let mut pending = std::mem::take(&mut self.tasks);
        // Stable sort keeps registration order within a kind.
        pending.sort_by_key(|t| std::cmp::Reverse(t.priority));

        let timeout = Duration::from_millis(self.config.task_timeout_ms);
        let mut results: HashMap<String, TaskResult<T>> = HashMap::new();
        let mut running: JoinSet<TaskResult<T>> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, String> = HashMap::new();

        info!(
            "executing build graph: {} tasks, concurrency {}",
            pending.len(),
            self.config.concurrency
        );

        loop {
            self.dispatch(&mut pending, &results, &mut running, &mut inflight, timeout);

            // Nothing running and nothing dispatchable: whatever is left
            // can never start (failed, unknown or circular dependencies).
            if running.is_empty() {
                if pending.is_empty() {
                    break;
                }
                for task in pending.drain(..) {
                    let dependency = first_unmet_dependency(&task, &results);
                    warn!(
                        "build task {} skipped: dependency {} unsatisfiable",
                        task.id, dependency
                    );
                    let result = TaskResult::failure(
                        task.id.clone(),
                        TaskError::DependencyFailed {
                            id: task.id.clone(),
                            dependency,
                        },
                        Duration::ZERO,
                        0,
                    );
                    self.handlers.emit(&TaskEvent::TaskFailed {
                        id: result.id.clone(),
                        error: result
                            .error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_default(),
                    });
                    results.entry(result.id.clone()).or_insert(result);
                }
                break;
            }

            let Some(joined) = running.join_next_with_id().await else {
                continue;
            };
            let result = match joined {
                Ok((task_id, result)) => {
                    inflight.remove(&task_id);
                    result
                }
                Err(join_error) => {
                    let id = inflight
                        .remove(&join_error.id())
                        .unwrap_or_else(|| "unknown".to_string());
                    error!("build task {} panicked: {}", id, join_error);
                    TaskResult::failure(
                        id.clone(),
                        TaskError::Failed(format!("task panicked: {join_error}")),
                        Duration::ZERO,
                        0,
                    )
                }
            };

            let failed = !result.is_success();
            self.emit_terminal(&result);
            let id = result.id.clone();
            // Results are terminal; never overwrite an existing entry.
            results.entry(id.clone()).or_insert(result);

            if failed && !self.config.continue_on_error {
                warn!("halting build: task {} failed and continue_on_error is off", id);
                running.shutdown().await;
                let message = results
                    .get(&id)
                    .and_then(|r| r.error.as_ref())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(anyhow!("build task '{id}' failed: {message}"));
            }
        }

        let failures = results.values().filter(|r| !r.is_success()).count();
        info!(
            "build graph complete: {} tasks, {} failed",
            results.len(),
            failures
        );
        Ok(results)
    }

    /// Start every eligible pending task while slots remain. Ineligible
    /// tasks stay pending for a later pass.
    fn dispatch(
        &self,
        pending: &mut Vec<Task<T>>,
        results: &HashMap<String, TaskResult<T>>,
        running: &mut JoinSet<TaskResult<T>>,
        inflight: &mut HashMap<tokio::task::Id, String>,
        timeout: Duration,
    ) {
        while running.len() < self.config.concurrency.max(1) {
            let Some(index) = pending.iter().position(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| results.get(dep).is_some_and(|r| r.is_success()))
            }) else {
                break;
            };
            let task = pending.remove(index);
            debug!("dispatching build task {}", task.id);
            self.handlers.emit(&TaskEvent::TaskStarted {
                id: task.id.clone(),
            });
            let handlers = self.handlers.clone();
            let handle = running.spawn(run_attempts(
                task.clone(),
                task.timeout.unwrap_or(timeout),
                task.retries.unwrap_or(0),
                RetryBackoff::Immediate,
                handlers,
            ));
            inflight.insert(handle.id(), task.id);
        }
    }

    fn emit_terminal(&self, result: &TaskResult<T>) {
        if result.is_success() {
            self.handlers.emit(&TaskEvent::TaskCompleted {
                id: result.id.clone(),
                duration_ms: result.duration.as_millis() as u64,
            });
        } else {
            self.handlers.emit(&TaskEvent::TaskFailed {
                id: result.id.clone(),
                error: result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            });
        }
    }
}

fn first_unmet_dependency<T>(task: &Task<T>, results: &HashMap<String, TaskResult<T>>) -> String {
    task.dependencies
        .iter()
        .find(|dep| !results.get(*dep).is_some_and(|r| r.is_success()))
        .cloned()
        .unwrap_or_else(|| "<none>".to_string())
}
