//! Shared dispatch machinery for the cooperative schedulers.
//!
//! Both [`crate::task::queue::TaskQueue`] and
//! [`crate::task::processor::ParallelProcessor`] drive the same core: a
//! pending list ordered by the caller, a running set bounded by the active
//! concurrency limit, and a results map that gates dependent tasks. All
//! bookkeeping is mutated behind a mutex that is never held across an await.

use crate::error::TaskError;
use crate::task::events::{Handlers, TaskEvent};
use crate::task::types::{RetryBackoff, Task, TaskResult};
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A pending task plus its submission sequence number, used to keep
/// priority ties in insertion order.
pub(crate) struct Queued<T> {
    pub task: Task<T>,
    pub seq: u64,
}

/// Scheduler bookkeeping shared by queue and processor.
pub(crate) struct SchedCore<T> {
    pub pending: Vec<Queued<T>>,
    pub running: HashSet<String>,
    /// Every id this instance has ever accepted; enforces id uniqueness.
    pub seen: HashSet<String>,
    pub paused: bool,
    pub next_seq: u64,
}

impl<T> Default for SchedCore<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            running: HashSet::new(),
            seen: HashSet::new(),
            paused: false,
            next_seq: 0,
        }
    }
}

impl<T> SchedCore<T> {
    /// Accept a task, rejecting duplicate ids for this instance's lifetime.
    pub fn submit(&mut self, task: Task<T>) -> Result<(), TaskError> {
        if !self.seen.insert(task.id.clone()) {
            return Err(TaskError::DuplicateTask(task.id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Queued { task, seq });
        Ok(())
    }

    /// Drop pending work and forget ids that never produced a result, so
    /// they may be resubmitted. Running tasks are unaffected.
    pub fn clear<U>(&mut self, results: &DashMap<String, TaskResult<U>>) {
        for queued in self.pending.drain(..) {
            self.seen.remove(&queued.task.id);
        }
        let running = &self.running;
        self.seen
            .retain(|id| running.contains(id) || results.contains_key(id));
        results.clear();
    }

    /// Index of the first pending task whose dependencies all hold a
    /// successful result, honoring the current pending order.
    pub fn eligible_index<U>(&self, results: &DashMap<String, TaskResult<U>>) -> Option<usize> {
        self.pending.iter().position(|queued| {
            queued.task.dependencies.iter().all(|dep| {
                results
                    .get(dep)
                    .map(|r| r.is_success())
                    .unwrap_or(false)
            })
        })
    }

    /// Remove pending tasks that can never become eligible: a dependency
    /// failed, or references an id this scheduler will never produce.
    /// Iterates to a fixpoint so chains of dependents are pruned together.
    /// Returns the skipped ids; they deliberately leave no result entry.
    pub fn prune_blocked<U>(&mut self, results: &DashMap<String, TaskResult<U>>) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let pending_ids: HashSet<String> = self
                .pending
                .iter()
                .map(|q| q.task.id.clone())
                .collect();
            let mut removed_this_pass = Vec::new();

            let running = &self.running;
            self.pending.retain(|queued| {
                let doomed = queued.task.dependencies.iter().any(|dep| {
                    if let Some(result) = results.get(dep) {
                        !result.is_success()
                    } else {
                        // No result yet: still satisfiable only if the
                        // dependency is pending or running here.
                        !pending_ids.contains(dep) && !running.contains(dep)
                    }
                });
                if doomed {
                    removed_this_pass.push(queued.task.id.clone());
                }
                !doomed
            });

            if removed_this_pass.is_empty() {
                break;
            }
            for id in &removed_this_pass {
                debug!("skipping task {}: dependency cannot be satisfied", id);
            }
            skipped.extend(removed_this_pass);
        }
        skipped
    }

    /// Break a dependency cycle among the remaining pending tasks by
    /// dropping them all. Cycles are caller bugs; skipping keeps `wait_all`
    /// from hanging forever.
    pub fn drop_cycle(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.pending.iter().map(|q| q.task.id.clone()).collect();
        if !ids.is_empty() {
            warn!(
                "dropping {} tasks with circular dependencies: {:?}",
                ids.len(),
                ids
            );
        }
        self.pending.clear();
        ids
    }
}

/// Execute one task to a terminal result: race each attempt against the
/// timeout, retrying until the budget is exhausted. The recorded duration is
/// total wall time across attempts; `retry_count` is attempts beyond the
/// first (capped at the configured budget on exhaustion).
pub(crate) async fn run_attempts<T: Send + 'static>(
    task: Task<T>,
    timeout: Duration,
    retry_budget: u32,
    backoff: RetryBackoff,
    handlers: Handlers,
) -> TaskResult<T> {
    let started = Instant::now();
    let timeout_ms = timeout.as_millis() as u64;
    let mut attempt: u32 = 0;

    loop {
        let error = match tokio::time::timeout(timeout, task.work.run()).await {
            Ok(Ok(data)) => {
                return TaskResult::success(task.id, data, started.elapsed(), attempt);
            }
            Ok(Err(e)) => TaskError::Failed(e.to_string()),
            Err(_) => {
                handlers.emit(&TaskEvent::TaskTimeout {
                    id: task.id.clone(),
                    timeout_ms,
                });
                TaskError::Timeout {
                    id: task.id.clone(),
                    timeout_ms,
                }
            }
        };

        if attempt >= retry_budget {
            return TaskResult::failure(task.id, error, started.elapsed(), retry_budget);
        }

        attempt += 1;
        handlers.emit(&TaskEvent::TaskRetry {
            id: task.id.clone(),
            attempt,
        });
        if let Some(delay) = backoff.delay(attempt - 1) {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn results() -> DashMap<String, TaskResult<u32>> {
        DashMap::new()
    }

    #[test]
    fn test_submit_rejects_duplicate_ids() {
        let mut core: SchedCore<u32> = SchedCore::default();
        core.submit(Task::new("a", || async { Ok(1) })).unwrap();

        let err = core
            .submit(Task::new("a", || async { Ok(2) }))
            .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateTask(id) if id == "a"));
    }

    #[test]
    fn test_eligible_index_respects_dependencies() {
        let mut core: SchedCore<u32> = SchedCore::default();
        let map = results();
        core.submit(
            Task::new("b", || async { Ok(2) }).with_dependencies(vec!["a".to_string()]),
        )
        .unwrap();
        core.submit(Task::new("a", || async { Ok(1) })).unwrap();

        // "b" is first in pending order but blocked on "a".
        assert_eq!(core.eligible_index(&map), Some(1));

        map.insert(
            "a".to_string(),
            TaskResult::success("a".to_string(), 1, Duration::ZERO, 0),
        );
        assert_eq!(core.eligible_index(&map), Some(0));
    }

    #[test]
    fn test_prune_blocked_cascades() {
        let mut core: SchedCore<u32> = SchedCore::default();
        let map = results();
        map.insert(
            "a".to_string(),
            TaskResult::failure(
                "a".to_string(),
                TaskError::Failed("boom".to_string()),
                Duration::ZERO,
                0,
            ),
        );
        core.submit(
            Task::new("b", || async { Ok(2) }).with_dependencies(vec!["a".to_string()]),
        )
        .unwrap();
        core.submit(
            Task::new("c", || async { Ok(3) }).with_dependencies(vec!["b".to_string()]),
        )
        .unwrap();

        let mut skipped = core.prune_blocked(&map);
        skipped.sort();
        assert_eq!(skipped, vec!["b".to_string(), "c".to_string()]);
        assert!(core.pending.is_empty());
    }

    #[tokio::test]
    async fn test_run_attempts_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let task = Task::new("flaky", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(7u32)
            }
        });

        let result = run_attempts(
            task,
            Duration::from_secs(1),
            2,
            RetryBackoff::Immediate,
            Handlers::new(),
        )
        .await;

        assert!(result.is_success());
        assert_eq!(result.data, Some(7));
        assert_eq!(result.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_attempts_timeout_is_prompt() {
        let task: Task<u32> = Task::new("slow", || async {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            Ok(1)
        });

        let started = Instant::now();
        let result = run_attempts(
            task,
            Duration::from_millis(50),
            0,
            RetryBackoff::Immediate,
            Handlers::new(),
        )
        .await;

        assert!(!result.is_success());
        assert!(result.error.as_ref().unwrap().is_timeout());
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
