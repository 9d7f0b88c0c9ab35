//! True-parallel execution on a pool of OS threads.
//!
//! Used for CPU-bound work that must run outside the async runtime. Each
//! worker owns one `std::thread`; the pool hands a worker at most one task
//! at a time and restores capacity by spawning a replacement whenever a
//! worker panics, exits, or is abandoned after a timeout.

use crate::error::TaskError;
use crate::task::events::{EventHandler, Handlers, TaskEvent};
use crate::task::types::TaskResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc as async_mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for [`WorkerPool`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads. Defaults to the CPU core count.
    pub max_workers: usize,
    /// Timeout for a single task; on expiry the assigned worker is
    /// abandoned and replaced.
    pub task_timeout_ms: u64,
    /// Advisory per-worker memory budget. Native threads share the process
    /// heap, so this is recorded and logged but not enforced by the OS.
    pub memory_limit_mb: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            task_timeout_ms: 60_000,
            memory_limit_mb: 512,
        }
    }
}

/// Snapshot of pool state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub terminated: bool,
}

/// A CPU-bound unit of work for the pool. The closure runs exactly once on
/// a worker thread.
pub struct WorkerTask<T> {
    pub id: String,
    work: Box<dyn FnOnce() -> Result<T> + Send>,
}

impl<T> WorkerTask<T> {
    pub fn new(id: impl Into<String>, work: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        Self {
            id: id.into(),
            work: Box::new(work),
        }
    }
}

struct JobReply<T> {
    result: Result<T, TaskError>,
    duration: Duration,
}

struct Job<T> {
    task_id: String,
    work: Box<dyn FnOnce() -> Result<T> + Send>,
    reply: oneshot::Sender<JobReply<T>>,
}

enum PoolMessage {
    Done { worker_id: Uuid },
    Crashed { worker_id: Uuid, reason: String },
}

/// One pooled OS thread. A worker is exclusively owned by the pool; task
/// ownership transfers to it for the duration of one job.
struct WorkerSlot<T> {
    id: Uuid,
    job_tx: mpsc::Sender<Job<T>>,
    busy: bool,
    current_task: Option<String>,
    started_at: Option<Instant>,
}

struct PoolState<T> {
    workers: Vec<WorkerSlot<T>>,
    queue: VecDeque<Job<T>>,
}

struct PoolInner<T> {
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    handlers: Handlers,
    msg_tx: async_mpsc::UnboundedSender<PoolMessage>,
    terminated: AtomicBool,
}

/// Fixed-size pool of OS threads with FIFO overflow queueing, per-task
/// timeouts, and self-healing worker replacement.
///
/// [`execute`](WorkerPool::execute) resolves or rejects one discrete unit
/// of work; [`execute_batch`](WorkerPool::execute_batch) captures per-task
/// failures into results instead.
pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn the pool's workers and its supervisor. Must be called within a
    /// tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let (msg_tx, msg_rx) = async_mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                workers: Vec::with_capacity(config.max_workers),
                queue: VecDeque::new(),
            }),
            handlers: Handlers::new(),
            msg_tx,
            terminated: AtomicBool::new(false),
            config,
        });

        {
            let mut state = lock(&inner.state);
            for _ in 0..inner.config.max_workers.max(1) {
                let slot = spawn_worker(&inner.config, inner.msg_tx.clone())?;
                state.workers.push(slot);
            }
        }
        info!(
            "worker pool started with {} workers ({}MB advisory limit each)",
            inner.config.max_workers, inner.config.memory_limit_mb
        );

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), msg_rx));
        Ok(Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Register a lifecycle event observer.
    pub fn add_event_handler(&self, handler: Box<dyn EventHandler>) {
        self.inner.handlers.add(handler);
    }

    /// Run one task on a worker thread. Resolves with the task's value, or
    /// fails on task error, worker crash, timeout, or a terminated pool.
    pub async fn execute(&self, task: WorkerTask<T>) -> Result<T, TaskError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(TaskError::Terminated);
        }

        let task_id = task.id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            task_id: task_id.clone(),
            work: task.work,
            reply: reply_tx,
        };

        {
            let mut state = lock(&self.inner.state);
            // Re-check under the lock: a racing terminate() may already
            // have drained the queue, and a job enqueued after that drain
            // would only ever time out.
            if self.inner.terminated.load(Ordering::SeqCst) {
                return Err(TaskError::Terminated);
            }
            if let Some(slot) = state.workers.iter_mut().find(|w| !w.busy) {
                assign(slot, job);
            } else {
                debug!("no idle worker; queueing task {}", task_id);
                state.queue.push_back(job);
            }
        }

        let timeout = Duration::from_millis(self.inner.config.task_timeout_ms);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                debug!(
                    "task {} finished on worker thread in {:?}",
                    task_id, reply.duration
                );
                reply.result
            }
            Ok(Err(_recv_gone)) => Err(TaskError::WorkerCrashed {
                worker_id: Uuid::nil(),
                reason: format!("worker dropped task '{task_id}' without replying"),
            }),
            Err(_elapsed) => {
                self.abandon_assignment(&task_id);
                self.inner.handlers.emit(&TaskEvent::TaskTimeout {
                    id: task_id.clone(),
                    timeout_ms: self.inner.config.task_timeout_ms,
                });
                Err(TaskError::Timeout {
                    id: task_id,
                    timeout_ms: self.inner.config.task_timeout_ms,
                })
            }
        }
    }

    /// Run several tasks, capturing each outcome into a [`TaskResult`]
    /// rather than failing the batch.
    pub async fn execute_batch(&self, tasks: Vec<WorkerTask<T>>) -> Vec<TaskResult<T>> {
        let runs = tasks.into_iter().map(|task| {
            let id = task.id.clone();
            async move {
                let started = Instant::now();
                match self.execute(task).await {
                    Ok(data) => TaskResult::success(id, data, started.elapsed(), 0),
                    Err(error) => TaskResult::failure(id, error, started.elapsed(), 0),
                }
            }
        });
        futures::future::join_all(runs).await
    }

    /// Current pool counters.
    pub fn get_status(&self) -> PoolStatus {
        let state = lock(&self.inner.state);
        PoolStatus {
            total_workers: state.workers.len(),
            busy_workers: state.workers.iter().filter(|w| w.busy).count(),
            queued_tasks: state.queue.len(),
            terminated: self.inner.terminated.load(Ordering::SeqCst),
        }
    }

    /// Shut the pool down for good: queued work is rejected, workers are
    /// released, and further [`execute`](Self::execute) calls fail
    /// immediately.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = lock(&self.inner.state);
            for job in state.queue.drain(..) {
                let _ = job.reply.send(JobReply {
                    result: Err(TaskError::Terminated),
                    duration: Duration::ZERO,
                });
            }
            // Dropping the senders ends each worker's receive loop once its
            // current job (if any) finishes.
            state.workers.clear();
        }
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        info!("worker pool terminated");
    }

    /// Abandon whichever worker holds the timed-out task and restore
    /// capacity with a fresh thread. The in-flight work cannot be recovered
    /// and keeps running detached until it finishes on its own.
    ///
    /// Events are emitted only after the state lock is released; handlers
    /// may call back into pool accessors.
    fn abandon_assignment(&self, task_id: &str) {
        let mut replaced = None;
        {
            let mut state = lock(&self.inner.state);
            // The task may still be queued if every worker was busy.
            state.queue.retain(|job| job.task_id != task_id);

            let Some(position) = state
                .workers
                .iter()
                .position(|w| w.current_task.as_deref() == Some(task_id))
            else {
                return;
            };
            let stale = &state.workers[position];
            let stale_id = stale.id;
            warn!(
                "abandoning worker {} stuck on task {} for {:?}",
                stale_id,
                task_id,
                stale.started_at.map(|s| s.elapsed())
            );

            match spawn_worker(&self.inner.config, self.inner.msg_tx.clone()) {
                Ok(replacement) => {
                    let replacement_id = replacement.id;
                    state.workers[position] = replacement;
                    replaced = Some(TaskEvent::WorkerReplaced {
                        worker_id: stale_id,
                        replacement_id,
                    });
                }
                Err(e) => {
                    error!("failed to respawn worker: {}", e);
                    state.workers.remove(position);
                }
            }
        }
        if let Some(event) = replaced {
            self.inner.handlers.emit(&event);
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

/// Hand a job to an idle worker. If its channel is gone the thread already
/// died; the job is requeued and the supervisor will hear about the crash.
fn assign<T>(slot: &mut WorkerSlot<T>, job: Job<T>) -> bool {
    let task_id = job.task_id.clone();
    match slot.job_tx.send(job) {
        Ok(()) => {
            slot.busy = true;
            slot.current_task = Some(task_id);
            slot.started_at = Some(Instant::now());
            true
        }
        Err(send_error) => {
            warn!("worker {} unreachable; dropping task {}", slot.id, task_id);
            slot.busy = true; // quarantine until the supervisor replaces it
            drop(send_error);
            false
        }
    }
}

/// React to worker completions and crashes: free or replace the slot, then
/// drain the overflow queue onto idle workers.
///
/// Events collected under the state lock are delivered only after the
/// guard drops; handlers may call back into pool accessors.
async fn supervise<T: Send + 'static>(
    inner: Arc<PoolInner<T>>,
    mut msg_rx: async_mpsc::UnboundedReceiver<PoolMessage>,
) {
    while let Some(message) = msg_rx.recv().await {
        if inner.terminated.load(Ordering::SeqCst) {
            break;
        }
        let mut events = Vec::new();
        {
            let mut state = lock(&inner.state);
            match message {
                PoolMessage::Done { worker_id } => {
                    if let Some(slot) = state.workers.iter_mut().find(|w| w.id == worker_id) {
                        slot.busy = false;
                        slot.current_task = None;
                        slot.started_at = None;
                    }
                    // A stale id from an abandoned worker is ignored.
                }
                PoolMessage::Crashed { worker_id, reason } => {
                    events.push(TaskEvent::WorkerCrashed { worker_id, reason });
                    if let Some(position) = state.workers.iter().position(|w| w.id == worker_id)
                    {
                        match spawn_worker(&inner.config, inner.msg_tx.clone()) {
                            Ok(replacement) => {
                                let replacement_id = replacement.id;
                                state.workers[position] = replacement;
                                events.push(TaskEvent::WorkerReplaced {
                                    worker_id,
                                    replacement_id,
                                });
                            }
                            Err(e) => {
                                error!("failed to respawn crashed worker: {}", e);
                                state.workers.remove(position);
                            }
                        }
                    }
                }
            }
            dispatch_queued(&mut state);
        }
        for event in &events {
            inner.handlers.emit(event);
        }
    }
}

fn dispatch_queued<T>(state: &mut PoolState<T>) {
    loop {
        let Some(index) = state.workers.iter().position(|w| !w.busy) else {
            break;
        };
        let Some(job) = state.queue.pop_front() else {
            break;
        };
        assign(&mut state.workers[index], job);
    }
}

/// Spawn one worker thread with its own job channel.
fn spawn_worker<T: Send + 'static>(
    config: &PoolConfig,
    msg_tx: async_mpsc::UnboundedSender<PoolMessage>,
) -> Result<WorkerSlot<T>> {
    let worker_id = Uuid::new_v4();
    let (job_tx, job_rx) = mpsc::channel::<Job<T>>();

    std::thread::Builder::new()
        .name(format!("pool-worker-{}", &worker_id.to_string()[..8]))
        .spawn(move || worker_loop(worker_id, job_rx, msg_tx))
        .with_context(|| format!("failed to spawn worker thread {worker_id}"))?;

    debug!(
        "spawned worker {} (advisory memory limit {}MB)",
        worker_id, config.memory_limit_mb
    );
    Ok(WorkerSlot {
        id: worker_id,
        job_tx,
        busy: false,
        current_task: None,
        started_at: None,
    })
}

/// Body of one worker thread: execute jobs until the pool drops the channel
/// or the job panics. A panic replies with a crash error, notifies the
/// supervisor, and ends the thread so a replacement takes over.
fn worker_loop<T>(
    worker_id: Uuid,
    job_rx: mpsc::Receiver<Job<T>>,
    msg_tx: async_mpsc::UnboundedSender<PoolMessage>,
) {
    while let Ok(job) = job_rx.recv() {
        let started = Instant::now();
        match catch_unwind(AssertUnwindSafe(job.work)) {
            Ok(outcome) => {
                let reply = JobReply {
                    result: outcome.map_err(|e| TaskError::Failed(e.to_string())),
                    duration: started.elapsed(),
                };
                let _ = job.reply.send(reply);
                if msg_tx.send(PoolMessage::Done { worker_id }).is_err() {
                    return;
                }
            }
            Err(panic_payload) => {
                let reason = panic_message(panic_payload);
                let _ = job.reply.send(JobReply {
                    result: Err(TaskError::WorkerCrashed {
                        worker_id,
                        reason: reason.clone(),
                    }),
                    duration: started.elapsed(),
                });
                let _ = msg_tx.send(PoolMessage::Crashed { worker_id, reason });
                return;
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn lock<M>(mutex: &Mutex<M>) -> std::sync::MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::types::TaskStatus;
    use pretty_assertions::assert_eq;

    fn small_pool(workers: usize) -> WorkerPool<u64> {
        WorkerPool::new(PoolConfig {
            max_workers: workers,
            task_timeout_ms: 2_000,
            memory_limit_mb: 64,
        })
        .expect("pool should start")
    }

    #[tokio::test]
    async fn test_execute_returns_value() {
        let pool = small_pool(2);
        let result = pool
            .execute(WorkerTask::new("hash-1", || Ok(21 * 2)))
            .await
            .unwrap();
        assert_eq!(result, 42);
        pool.terminate();
    }

    #[tokio::test]
    async fn test_execute_propagates_task_error() {
        let pool = small_pool(1);
        let err = pool
            .execute(WorkerTask::new("bad-1", || {
                anyhow::bail!("checksum mismatch")
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Failed(msg) if msg.contains("checksum")));
        pool.terminate();
    }

    #[tokio::test]
    async fn test_batch_captures_failures() {
        let pool = small_pool(2);
        let results = pool
            .execute_batch(vec![
                WorkerTask::new("ok-1", || Ok(1)),
                WorkerTask::new("bad-2", || anyhow::bail!("nope")),
                WorkerTask::new("ok-3", || Ok(3)),
            ])
            .await;

        assert_eq!(results.len(), 3);
        let by_id: std::collections::HashMap<_, _> =
            results.iter().map(|r| (r.id.clone(), r)).collect();
        assert_eq!(by_id["ok-1"].status, TaskStatus::Success);
        assert_eq!(by_id["bad-2"].status, TaskStatus::Failure);
        assert_eq!(by_id["ok-3"].data, Some(3));
        pool.terminate();
    }

    #[tokio::test]
    async fn test_pool_self_heals_after_panic() {
        let pool = small_pool(2);
        let err = pool
            .execute(WorkerTask::new("panics-1", || panic!("worker blew up")))
            .await
            .unwrap_err();
        assert!(err.is_worker_crash());

        // Give the supervisor a moment to respawn the replacement.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = pool.get_status();
        assert_eq!(status.total_workers, 2);

        let value = pool
            .execute(WorkerTask::new("after-crash", || Ok(7)))
            .await
            .unwrap();
        assert_eq!(value, 7);
        pool.terminate();
    }

    #[tokio::test]
    async fn test_timeout_replaces_worker() {
        let pool = WorkerPool::new(PoolConfig {
            max_workers: 1,
            task_timeout_ms: 50,
            memory_limit_mb: 64,
        })
        .unwrap();

        let started = Instant::now();
        let err = pool
            .execute(WorkerTask::new("stuck-1", || {
                std::thread::sleep(Duration::from_millis(1_000));
                Ok(0)
            }))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(500));

        // Capacity restored; the replacement takes new work immediately.
        let value = pool
            .execute(WorkerTask::new("fresh-1", || Ok(9)))
            .await
            .unwrap();
        assert_eq!(value, 9);
        pool.terminate();
    }

    /// Observer that reads pool status from inside event delivery, the way
    /// a dashboard hook would.
    struct StatusPollingHandler {
        pool: Arc<WorkerPool<u64>>,
        observed: Arc<Mutex<Vec<usize>>>,
    }

    impl EventHandler for StatusPollingHandler {
        fn handle_event(&self, event: &TaskEvent) -> Result<()> {
            if matches!(
                event,
                TaskEvent::WorkerCrashed { .. } | TaskEvent::WorkerReplaced { .. }
            ) {
                let status = self.pool.get_status();
                self.observed.lock().unwrap().push(status.total_workers);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_may_query_status_during_self_heal() {
        let pool = Arc::new(small_pool(2));
        let observed = Arc::new(Mutex::new(Vec::new()));
        pool.add_event_handler(Box::new(StatusPollingHandler {
            pool: Arc::clone(&pool),
            observed: Arc::clone(&observed),
        }));

        let err = pool
            .execute(WorkerTask::new("panics-3", || panic!("worker blew up")))
            .await
            .unwrap_err();
        assert!(err.is_worker_crash());

        // Replacement still happens even with a handler that re-enters the
        // pool, and the handler actually ran.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.get_status().total_workers, 2);
        assert!(!observed.lock().unwrap().is_empty());

        let value = pool
            .execute(WorkerTask::new("after-heal", || Ok(11)))
            .await
            .unwrap();
        assert_eq!(value, 11);
        pool.terminate();
    }

    #[tokio::test]
    async fn test_terminate_rejects_queued_work_promptly() {
        let pool = Arc::new(
            WorkerPool::new(PoolConfig {
                max_workers: 1,
                task_timeout_ms: 5_000,
                memory_limit_mb: 64,
            })
            .unwrap(),
        );

        // Occupy the lone worker, then queue a second task behind it.
        let busy = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.execute(WorkerTask::new("busy-1", || {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(1)
                }))
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.execute(WorkerTask::new("queued-1", || Ok(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The queued task must be rejected right away, not after the full
        // task timeout.
        let started = Instant::now();
        pool.terminate();
        let err = queued.await.unwrap().unwrap_err();
        assert!(err.is_terminated());
        assert!(started.elapsed() < Duration::from_millis(1_000));
        let _ = busy.await;
    }

    #[tokio::test]
    async fn test_terminate_is_terminal() {
        let pool = small_pool(1);
        pool.terminate();

        let status = pool.get_status();
        assert!(status.terminated);

        let err = pool
            .execute(WorkerTask::new("late-1", || Ok(1)))
            .await
            .unwrap_err();
        assert!(err.is_terminated());
    }

    #[tokio::test]
    async fn test_overflow_queues_fifo() {
        let pool = small_pool(1);
        let results = pool
            .execute_batch(vec![
                WorkerTask::new("q-1", || {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(1)
                }),
                WorkerTask::new("q-2", || Ok(2)),
                WorkerTask::new("q-3", || Ok(3)),
            ])
            .await;

        assert!(results.iter().all(|r| r.is_success()));
        pool.terminate();
    }
}
