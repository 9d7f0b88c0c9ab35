use crate::error::TaskError;
use crate::system::SystemSnapshot;
use crate::task::events::{EventHandler, Handlers, TaskEvent};
use crate::task::exec::{run_attempts, Queued, SchedCore};
use crate::task::types::{PerformanceMetrics, RetryBackoff, Task, TaskResult, TaskStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Minimum terminal tasks before the success-rate signal participates in
/// concurrency decisions.
const MIN_SAMPLE_SIZE: u64 = 10;

/// Signals must sit below this fraction of their threshold before
/// concurrency is raised.
const HEADROOM_FACTOR: f64 = 0.8;

/// Success rate defaults used for scoring when a task type has no history.
const NEUTRAL_SUCCESS_RATE: f64 = 0.8;

/// Configuration for [`ParallelProcessor`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Initial concurrency limit; adapted at runtime when
    /// `auto_adjust_concurrency` is set.
    pub concurrency: usize,
    pub default_timeout_ms: u64,
    pub default_retries: u32,
    /// Periodically retune the concurrency limit from live system pressure
    /// and the rolling success rate.
    pub auto_adjust_concurrency: bool,
    /// Heap/memory used ratio above which concurrency steps down.
    pub memory_threshold: f64,
    /// Per-core load above which concurrency steps down.
    pub cpu_threshold: f64,
    /// Sampling period for the adaptive loop.
    pub adjust_interval_ms: u64,
    /// EMA weight for task history and duration averages.
    pub history_alpha: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_timeout_ms: 30_000,
            default_retries: 0,
            auto_adjust_concurrency: true,
            memory_threshold: 0.85,
            cpu_threshold: 0.90,
            adjust_interval_ms: 5_000,
            history_alpha: 0.25,
        }
    }
}

/// Rolling per-task-type statistics. Ordering hint only; never affects
/// correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeHistory {
    pub avg_duration_ms: f64,
    pub success_rate: f64,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Snapshot of processor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStatus {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    /// The live (possibly adapted) concurrency limit.
    pub concurrency: usize,
    pub paused: bool,
}

/// The task type a history entry is keyed by: the id prefix before the
/// first `-` or `:` separator, or the whole id.
pub(crate) fn task_type_of(id: &str) -> &str {
    id.split(['-', ':']).next().unwrap_or(id)
}

struct MetricsInner {
    total: u64,
    successful: u64,
    failed: u64,
    avg_duration_ms: f64,
}

/// State shared with the background sampling loop.
struct AdaptiveState {
    limit: AtomicUsize,
    metrics: Mutex<MetricsInner>,
    history: Mutex<HashMap<String, TypeHistory>>,
    started_at: Instant,
    handlers: Handlers,
    notify: Arc<Notify>,
    memory_threshold: f64,
    cpu_threshold: f64,
    history_alpha: f64,
}

impl AdaptiveState {
    fn metrics_snapshot(&self) -> PerformanceMetrics {
        let inner = lock(&self.metrics);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        PerformanceMetrics {
            total_tasks: inner.total,
            successful_tasks: inner.successful,
            failed_tasks: inner.failed,
            avg_duration_ms: inner.avg_duration_ms,
            throughput: if elapsed > 0.0 {
                inner.total as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    /// Fold a terminal task outcome into the per-type history and the
    /// aggregate metrics.
    fn observe(&self, id: &str, success: bool, duration: Duration) {
        let duration_ms = duration.as_millis() as f64;
        let alpha = self.history_alpha;
        let task_type = task_type_of(id).to_string();

        {
            let mut history = lock(&self.history);
            let entry = history.entry(task_type).or_insert_with(|| TypeHistory {
                avg_duration_ms: duration_ms,
                success_rate: if success { 1.0 } else { 0.0 },
                count: 0,
                last_updated: Utc::now(),
            });
            if entry.count > 0 {
                entry.avg_duration_ms = alpha * duration_ms + (1.0 - alpha) * entry.avg_duration_ms;
                let outcome = if success { 1.0 } else { 0.0 };
                entry.success_rate = alpha * outcome + (1.0 - alpha) * entry.success_rate;
            }
            entry.count += 1;
            entry.last_updated = Utc::now();
        }

        let mut metrics = lock(&self.metrics);
        metrics.total += 1;
        if success {
            metrics.successful += 1;
        } else {
            metrics.failed += 1;
        }
        metrics.avg_duration_ms = if metrics.total == 1 {
            duration_ms
        } else {
            alpha * duration_ms + (1.0 - alpha) * metrics.avg_duration_ms
        };
    }

    /// One adaptive control step: step the limit down under pressure, up
    /// only when every signal has comfortable headroom.
    fn adjust(&self, snapshot: &SystemSnapshot) {
        let old = self.limit.load(Ordering::Relaxed);
        let metrics = self.metrics_snapshot();
        let success_rate = metrics.success_rate();
        let ceiling = (snapshot.cpu_cores * 2).max(1);

        let decision: Option<(usize, String)> = if snapshot.memory_used_ratio
            > self.memory_threshold
        {
            Some((
                old.saturating_sub(1).max(1),
                format!(
                    "memory pressure ({:.0}% used)",
                    snapshot.memory_used_ratio * 100.0
                ),
            ))
        } else if snapshot.load_per_core > self.cpu_threshold {
            Some((
                old.saturating_sub(1).max(1),
                format!("cpu load ({:.2} per core)", snapshot.load_per_core),
            ))
        } else if metrics.total_tasks >= MIN_SAMPLE_SIZE && success_rate < 0.70 {
            Some((
                old.saturating_sub(1).max(1),
                format!("low success rate ({:.0}%)", success_rate * 100.0),
            ))
        } else if old < ceiling
            && snapshot.memory_used_ratio < self.memory_threshold * HEADROOM_FACTOR
            && snapshot.load_per_core < self.cpu_threshold * HEADROOM_FACTOR
            && success_rate > 0.90
        {
            Some((old + 1, "resource headroom".to_string()))
        } else {
            None
        };

        if let Some((new, reason)) = decision {
            if new != old {
                self.limit.store(new, Ordering::Relaxed);
                info!("concurrency {} -> {}: {}", old, new, reason);
                self.handlers
                    .emit(&TaskEvent::ConcurrencyAdjusted { old, new, reason });
                self.notify.notify_one();
            }
        }

        self.handlers.emit(&TaskEvent::MetricsUpdated { metrics });
    }
}

/// Adaptive parallel scheduler.
///
/// Offers the same contract as [`crate::task::TaskQueue`] with three
/// additions: pending tasks are re-ranked before every dispatch pass by
/// `(priority + 1) * success_rate / avg_duration` drawn from per-type
/// history, retries back off exponentially (`min(1000 * 2^n, 10000)` ms),
/// and a background loop retunes the concurrency limit from live memory
/// and CPU pressure plus the rolling success rate.
///
/// Known limitation, kept deliberately: the score-based reordering has no
/// aging term, so a low-scored pending task can be delayed indefinitely
/// while higher-scored work keeps arriving.
pub struct ParallelProcessor<T> {
    config: ProcessorConfig,
    state: Mutex<SchedCore<T>>,
    results: Arc<DashMap<String, TaskResult<T>>>,
    handlers: Handlers,
    notify: Arc<Notify>,
    adaptive: Arc<AdaptiveState>,
    sampler: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> ParallelProcessor<T> {
    /// Create a processor. The adaptive sampling loop starts with the first
    /// [`wait_all`](Self::wait_all) call (it needs a tokio runtime).
    pub fn new(config: ProcessorConfig) -> Self {
        let handlers = Handlers::new();
        let notify = Arc::new(Notify::new());
        let adaptive = Arc::new(AdaptiveState {
            limit: AtomicUsize::new(config.concurrency.max(1)),
            metrics: Mutex::new(MetricsInner {
                total: 0,
                successful: 0,
                failed: 0,
                avg_duration_ms: 0.0,
            }),
            history: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            handlers: handlers.clone(),
            notify: notify.clone(),
            memory_threshold: config.memory_threshold,
            cpu_threshold: config.cpu_threshold,
            history_alpha: config.history_alpha,
        });

        Self {
            config,
            state: Mutex::new(SchedCore::default()),
            results: Arc::new(DashMap::new()),
            handlers,
            notify,
            adaptive,
            sampler: Mutex::new(None),
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
            let mut state = lock(&self.state);
            state.submit(task)?;
        }
        self.handlers.emit(&TaskEvent::TaskAdded { id });
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
        lock(&self.state).paused = false;
        self.notify.notify_one();
    }

    /// Stop dispatching new tasks. Running tasks are not cancelled.
    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    /// Drop all pending tasks and recorded results. History and metrics
    /// persist for the processor's lifetime.
    pub fn clear(&self) {
        lock(&self.state).clear(&self.results);
        self.handlers.emit(&TaskEvent::Cleared);
        info!("processor cleared");
    }

    /// The recorded result for a task, if it has completed.
    pub fn get_result(&self, id: &str) -> Option<TaskResult<T>> {
        self.results.get(id).map(|entry| entry.value().clone())
    }

    /// Current processor counters, including the live concurrency limit.
    pub fn get_status(&self) -> ProcessorStatus {
        let state = lock(&self.state);
        ProcessorStatus {
            pending: state.pending.len(),
            running: state.running.len(),
            completed: self.results.len(),
            concurrency: self.adaptive.limit.load(Ordering::Relaxed),
            paused: state.paused,
        }
    }

    /// Aggregate performance counters.
    pub fn metrics(&self) -> PerformanceMetrics {
        self.adaptive.metrics_snapshot()
    }

    /// Per-task-type rolling history.
    pub fn history(&self) -> HashMap<String, TypeHistory> {
        lock(&self.adaptive.history).clone()
    }

    /// The concurrency limit currently in force.
    pub fn current_concurrency(&self) -> usize {
        self.adaptive.limit.load(Ordering::Relaxed)
    }

    /// Stop the adaptive sampling loop and drop pending work. Recorded
    /// results, history and metrics remain readable.
    pub fn dispose(&self) {
        if let Some(handle) = lock(&self.sampler).take() {
            handle.abort();
        }
        lock(&self.state).pending.clear();
        debug!("processor disposed");
    }

    /// Drive the processor until pending is empty and nothing is running,
    /// then return all recorded results. Never fails; tasks skipped over a
    /// failed dependency are absent from the map.
    pub async fn wait_all(&self) -> HashMap<String, TaskResult<T>> {
        self.ensure_sampler();

        let mut running: JoinSet<TaskResult<T>> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            self.dispatch_ready(&mut running, &mut inflight);

            if running.is_empty() {
                let (pending_left, paused) = {
                    let state = lock(&self.state);
                    (state.pending.len(), state.paused)
                };
                if pending_left == 0 {
                    break;
                }
                if paused {
                    self.notify.notified().await;
                    continue;
                }
                let mut state = lock(&self.state);
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

    /// Score used for smart reordering; favors fast, reliable,
    /// high-priority task types.
    fn score(&self, task: &Task<T>, history: &HashMap<String, TypeHistory>) -> f64 {
        let (success_rate, avg_duration_ms) = history
            .get(task_type_of(&task.id))
            .map(|h| (h.success_rate, h.avg_duration_ms))
            .unwrap_or((
                NEUTRAL_SUCCESS_RATE,
                self.config.default_timeout_ms as f64 / 2.0,
            ));
        (task.priority as f64 + 1.0) * success_rate / avg_duration_ms.max(1.0)
    }

    fn dispatch_ready(
        &self,
        running: &mut JoinSet<TaskResult<T>>,
        inflight: &mut HashMap<tokio::task::Id, String>,
    ) {
        let limit = self.adaptive.limit.load(Ordering::Relaxed);
        let mut started = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.paused {
                return;
            }

            // Re-rank before every dispatch pass; history changes as
            // results land.
            let history = lock(&self.adaptive.history).clone();
            let mut scored: Vec<(usize, f64)> = state
                .pending
                .iter()
                .enumerate()
                .map(|(i, queued)| (i, self.score(&queued.task, &history)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let order: Vec<usize> = scored.into_iter().map(|(i, _)| i).collect();
            let mut reordered = Vec::with_capacity(state.pending.len());
            let mut drained: Vec<Option<Queued<T>>> =
                state.pending.drain(..).map(Some).collect();
            for index in order {
                if let Some(queued) = drained[index].take() {
                    reordered.push(queued);
                }
            }
            state.pending = reordered;

            while state.running.len() < limit {
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
                    RetryBackoff::Exponential {
                        base_ms: 1_000,
                        cap_ms: 10_000,
                    },
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
        // History is updated unconditionally on every terminal attempt.
        self.adaptive
            .observe(&result.id, result.is_success(), result.duration);
        {
            let mut state = lock(&self.state);
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
        self.results.entry(result.id.clone()).or_insert(result);
        self.handlers.emit(&event);
        self.notify.notify_one();
    }

    /// Spawn the adaptive loop if configured and not yet running.
    fn ensure_sampler(&self) {
        if !self.config.auto_adjust_concurrency {
            return;
        }
        let mut sampler = lock(&self.sampler);
        if sampler.is_some() {
            return;
        }
        let adaptive = Arc::clone(&self.adaptive);
        let interval = Duration::from_millis(self.config.adjust_interval_ms.max(100));
        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the initial limit
            // holds for one full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = SystemSnapshot::capture();
                adaptive.adjust(&snapshot);
            }
        }));
    }
}

impl<T> Drop for ParallelProcessor<T> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sampler).take() {
            handle.abort();
        }
    }
}

fn lock<M>(mutex: &Mutex<M>) -> std::sync::MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("scheduler lock poisoned; continuing with recovered state");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn adaptive_fixture(limit: usize) -> (Arc<AdaptiveState>, Handlers) {
        let handlers = Handlers::new();
        let state = Arc::new(AdaptiveState {
            limit: AtomicUsize::new(limit),
            metrics: Mutex::new(MetricsInner {
                total: 0,
                successful: 0,
                failed: 0,
                avg_duration_ms: 0.0,
            }),
            history: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            handlers: handlers.clone(),
            notify: Arc::new(Notify::new()),
            memory_threshold: 0.85,
            cpu_threshold: 0.90,
            history_alpha: 0.25,
        });
        (state, handlers)
    }

    fn snapshot(memory: f64, load: f64) -> SystemSnapshot {
        SystemSnapshot {
            memory_used_ratio: memory,
            load_per_core: load,
            cpu_cores: 8,
        }
    }

    #[test]
    fn test_task_type_of_splits_on_separators() {
        assert_eq!(task_type_of("format-esm"), "format");
        assert_eq!(task_type_of("dts:generate"), "dts");
        assert_eq!(task_type_of("analyze"), "analyze");
    }

    #[test]
    fn test_adjust_steps_down_under_memory_pressure() {
        let (state, _) = adaptive_fixture(4);
        state.adjust(&snapshot(0.95, 0.1));
        assert_eq!(state.limit.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_adjust_never_drops_below_one() {
        let (state, _) = adaptive_fixture(1);
        state.adjust(&snapshot(0.99, 0.99));
        assert_eq!(state.limit.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_adjust_steps_up_only_with_headroom() {
        let (state, _) = adaptive_fixture(4);
        // Success rate defaults to 1.0 with no samples; low pressure.
        state.adjust(&snapshot(0.2, 0.1));
        assert_eq!(state.limit.load(Ordering::Relaxed), 5);

        // Just below threshold but above the headroom margin: hold steady.
        state.adjust(&snapshot(0.80, 0.1));
        assert_eq!(state.limit.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_adjust_respects_core_ceiling() {
        let (state, _) = adaptive_fixture(16);
        // Ceiling is 2 * 8 cores.
        state.adjust(&snapshot(0.1, 0.1));
        assert_eq!(state.limit.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_adjust_steps_down_on_low_success_rate() {
        let (state, _) = adaptive_fixture(4);
        for i in 0..12 {
            state.observe("format-x", i % 2 == 0, Duration::from_millis(10));
        }
        state.adjust(&snapshot(0.1, 0.1));
        assert_eq!(state.limit.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_observe_ema_math() {
        let (state, _) = adaptive_fixture(4);
        state.observe("format-esm", true, Duration::from_millis(100));
        state.observe("format-cjs", true, Duration::from_millis(200));

        let history = lock(&state.history);
        let entry = history.get("format").unwrap();
        assert_eq!(entry.count, 2);
        // 0.25 * 200 + 0.75 * 100
        assert!((entry.avg_duration_ms - 125.0).abs() < 1e-9);
        assert!((entry.success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_processor_runs_dependency_chain() {
        let processor = ParallelProcessor::new(ProcessorConfig {
            auto_adjust_concurrency: false,
            ..Default::default()
        });
        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, deps) in [
            ("compile-a", vec![]),
            ("link-b", vec!["compile-a".to_string()]),
            (
                "package-c",
                vec!["compile-a".to_string(), "link-b".to_string()],
            ),
        ] {
            let order = order.clone();
            processor
                .add(
                    Task::new(id, move || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(id.to_string());
                            Ok(())
                        }
                    })
                    .with_dependencies(deps),
                )
                .unwrap();
        }

        let results = processor.wait_all().await;
        assert_eq!(results.len(), 3);
        let order = order.lock().unwrap();
        assert_eq!(order.as_slice(), ["compile-a", "link-b", "package-c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_delays_reattempts() {
        let processor = ParallelProcessor::new(ProcessorConfig {
            auto_adjust_concurrency: false,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        processor
            .add(
                Task::new("flaky-fetch", move || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("transient");
                        }
                        Ok(())
                    }
                })
                .with_retries(1),
            )
            .unwrap();

        let started = tokio::time::Instant::now();
        let results = processor.wait_all().await;
        // First backoff step is 1000ms of (virtual) time.
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert!(results["flaky-fetch"].is_success());
        assert_eq!(results["flaky-fetch"].retry_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_history_informs_reordering() {
        let processor: ParallelProcessor<()> = ParallelProcessor::new(ProcessorConfig {
            concurrency: 1,
            auto_adjust_concurrency: false,
            ..Default::default()
        });

        // Seed history: "slow" type is an order of magnitude slower.
        processor
            .adaptive
            .observe("slow-seed", true, Duration::from_millis(1_000));
        processor
            .adaptive
            .observe("fast-seed", true, Duration::from_millis(10));

        let order = Arc::new(Mutex::new(Vec::new()));
        for id in ["slow-one", "fast-one"] {
            let order = order.clone();
            processor
                .add(Task::new(id, move || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(id.to_string());
                        Ok(())
                    }
                }))
                .unwrap();
        }

        processor.wait_all().await;
        let order = order.lock().unwrap();
        // Equal priorities: the historically faster type dispatches first
        // even though it was submitted second.
        assert_eq!(order.as_slice(), ["fast-one", "slow-one"]);
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let processor = ParallelProcessor::new(ProcessorConfig {
            auto_adjust_concurrency: false,
            ..Default::default()
        });
        processor
            .add(Task::new("ok-task", || async { Ok(1u32) }))
            .unwrap();
        processor
            .add(Task::new("bad-task", || async {
                anyhow::bail!("nope")
            }))
            .unwrap();

        processor.wait_all().await;
        let metrics = processor.metrics();
        assert_eq!(metrics.total_tasks, 2);
        assert_eq!(metrics.successful_tasks, 1);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.success_rate(), 0.5);
    }
}
