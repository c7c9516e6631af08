// Pipeline Executor
// Runs the task graph batch by batch with retries, timeouts and failure propagation

use crate::config::models::{Settings, TaskDef};
use crate::error::TaskError;
use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::TaskGraph;
use crate::execution::report::{AttemptOutcome, AttemptRecord, PipelineOutcome, RunReport};
use crate::execution::retry::RetryPolicy;
use crate::execution::state::{TaskState, TaskStates};
use crate::load::TaskOutput;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum tasks running at once (0 = unlimited)
    pub max_concurrency: usize,
    /// Retry budget for tasks without their own
    pub default_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Settings::default().into()
    }
}

impl From<&Settings> for ExecutorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            default_retry: settings.retry,
        }
    }
}

impl From<Settings> for ExecutorConfig {
    fn from(settings: Settings) -> Self {
        Self::from(&settings)
    }
}

/// Performs a single attempt of a task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskDef, ctx: &ExecutionContext) -> Result<TaskOutput, TaskError>;
}

/// Runs the task's configured action
pub struct ActionRunner;

#[async_trait]
impl TaskRunner for ActionRunner {
    async fn run(&self, task: &TaskDef, ctx: &ExecutionContext) -> Result<TaskOutput, TaskError> {
        task.action.execute(ctx).await
    }
}

/// Pipeline executor
pub struct PipelineExecutor {
    config: ExecutorConfig,
    runner: Arc<dyn TaskRunner>,
    event_tx: Option<ProgressSender>,
}

impl PipelineExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            runner: Arc::new(ActionRunner),
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Replace the action runner
    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run every task in the graph and return the complete report
    ///
    /// Batches run strictly in order; tasks inside a batch run concurrently.
    /// Task errors never escape: they are recorded and propagated as skips.
    pub async fn run(&self, graph: &TaskGraph, ctx: ExecutionContext) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::new(&ctx.pipeline_name, &ctx.run_id);
        let states = Arc::new(Mutex::new(TaskStates::new(
            graph.iter().map(|t| t.id.as_str()),
        )));
        let semaphore =
            (self.config.max_concurrency > 0).then(|| Arc::new(Semaphore::new(self.config.max_concurrency)));

        let batches = graph.topological_batches();
        info!(
            pipeline = %ctx.pipeline_name,
            run_id = %ctx.run_id,
            tasks = graph.len(),
            batches = batches.len(),
            "starting pipeline run"
        );
        self.event_tx.send_event(ExecutionEvent::pipeline_started(
            &ctx.pipeline_name,
            graph.len(),
            batches.len(),
        ));

        for (index, batch) in batches.iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }

            let runnable: Vec<&TaskDef> = {
                let states = lock_states(&states);
                batch
                    .iter()
                    .filter(|id| states.is_pending(id))
                    .filter_map(|id| graph.get(id))
                    .collect()
            };
            if runnable.is_empty() {
                debug!(batch = index, "nothing runnable in batch");
                continue;
            }

            let ids: Vec<String> = runnable.iter().map(|t| t.id.clone()).collect();
            debug!(batch = index, tasks = ?ids, "launching batch");
            self.event_tx.send_event(ExecutionEvent::BatchStarted {
                index,
                tasks: ids,
            });

            let mut handles = Vec::with_capacity(runnable.len());
            for task in runnable {
                let attempt = TaskAttempts {
                    policy: task.retry.unwrap_or(self.config.default_retry),
                    task: task.clone(),
                    runner: Arc::clone(&self.runner),
                    ctx: ctx.clone(),
                    semaphore: semaphore.clone(),
                    event_tx: self.event_tx.clone(),
                    states: Arc::clone(&states),
                };
                handles.push((task.id.clone(), tokio::spawn(attempt.run())));
            }

            // Wait for the whole batch before advancing
            for (id, handle) in handles {
                let records = match handle.await {
                    Ok(records) => records,
                    Err(join_error) => {
                        error!(task = %id, error = %join_error, "task aborted");
                        let error = TaskError::permanent(format!("task aborted: {}", join_error));
                        vec![AttemptRecord::failed(&id, 1, Utc::now(), &error)]
                    }
                };
                let mut states = lock_states(&states);
                self.settle(graph, &id, records, &mut states, &mut report);
            }
        }

        let mut states = lock_states(&states);
        let cancelled = ctx.is_cancelled();
        if cancelled {
            warn!(pipeline = %ctx.pipeline_name, "run cancelled, skipping remaining tasks");
            for task in graph.iter() {
                if states.is_pending(&task.id) {
                    self.skip(&task.id, None, "cancelled", &mut states, &mut report);
                }
            }
        }

        let outcome = if states.count(TaskState::Failed) == 0 && states.count(TaskState::Skipped) == 0 {
            PipelineOutcome::Success
        } else {
            PipelineOutcome::Failure
        };
        report.finish(outcome, cancelled);

        let duration = start.elapsed();
        info!(
            pipeline = %ctx.pipeline_name,
            outcome = %outcome,
            succeeded = states.count(TaskState::Succeeded),
            failed = states.count(TaskState::Failed),
            skipped = states.count(TaskState::Skipped),
            duration_ms = duration.as_millis() as u64,
            "pipeline run finished"
        );
        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &ctx.pipeline_name,
            outcome,
            duration,
        ));

        report
    }

    /// Record a finished task and propagate failure to its dependents
    fn settle(
        &self,
        graph: &TaskGraph,
        id: &str,
        records: Vec<AttemptRecord>,
        states: &mut TaskStates,
        report: &mut RunReport,
    ) {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            // Cancelled before the first attempt started
            self.skip(id, None, "cancelled", states, report);
            return;
        };

        let state = if last.outcome == AttemptOutcome::Succeeded {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        let duration = (last.finished_at - first.started_at)
            .to_std()
            .unwrap_or_default();
        let attempts = records.len() as u32;

        for record in records {
            report.append(record);
        }
        transition(states, id, state);

        self.event_tx.send_event(ExecutionEvent::TaskCompleted {
            task: id.to_string(),
            state,
            attempts,
            duration,
        });

        if state == TaskState::Failed {
            let reason = format!("upstream task '{}' failed", id);
            for dependent in graph.dependents(id) {
                if states.is_pending(dependent) {
                    self.skip(dependent, Some(id), &reason, states, report);
                }
            }
        }
    }

    fn skip(
        &self,
        id: &str,
        upstream: Option<&str>,
        reason: &str,
        states: &mut TaskStates,
        report: &mut RunReport,
    ) {
        info!(task = %id, reason = %reason, "skipping task");
        transition(states, id, TaskState::Skipped);
        report.append(AttemptRecord::skipped(id, upstream.map(String::from), reason));
        self.event_tx
            .send_event(ExecutionEvent::task_skipped(id, reason));
    }
}

fn lock_states(states: &Mutex<TaskStates>) -> MutexGuard<'_, TaskStates> {
    states.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transition(states: &mut TaskStates, id: &str, next: TaskState) {
    if let Err(e) = states.advance(id, next) {
        error!(error = %e, "invalid task state transition");
    }
}

/// Everything one spawned task needs to run its attempts
struct TaskAttempts {
    task: TaskDef,
    policy: RetryPolicy,
    runner: Arc<dyn TaskRunner>,
    ctx: ExecutionContext,
    semaphore: Option<Arc<Semaphore>>,
    event_tx: Option<ProgressSender>,
    states: Arc<Mutex<TaskStates>>,
}

impl TaskAttempts {
    /// Attempt the task until it succeeds, fails permanently or runs out of budget
    ///
    /// Returns no records when cancellation arrived before the first attempt.
    async fn run(self) -> Vec<AttemptRecord> {
        let id = self.task.id.as_str();
        let max_attempts = self.policy.max_attempts();
        let mut records = Vec::new();

        for attempt in 1..=max_attempts {
            if self.ctx.is_cancelled() {
                break;
            }

            let permit = match &self.semaphore {
                Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };
            if self.ctx.is_cancelled() {
                break;
            }

            if attempt == 1 {
                transition(&mut lock_states(&self.states), id, TaskState::Running);
            }
            debug!(task = %id, attempt, "starting attempt");
            self.event_tx
                .send_event(ExecutionEvent::task_started(id, attempt));

            let started_at = Utc::now();
            let result = self.attempt().await;
            drop(permit);

            let error = match result {
                Ok(output) => {
                    info!(task = %id, attempt, "task succeeded");
                    records.push(AttemptRecord::succeeded(id, attempt, started_at, output));
                    break;
                }
                Err(error) => error,
            };

            records.push(AttemptRecord::failed(id, attempt, started_at, &error));

            let retry = error.is_retryable() && attempt < max_attempts && !self.ctx.is_cancelled();
            if !retry {
                error!(
                    task = %id,
                    attempt,
                    kind = %error.kind(),
                    error = %error,
                    "task failed"
                );
                self.event_tx.send_event(ExecutionEvent::AttemptFailed {
                    task: id.to_string(),
                    attempt,
                    error: error.detail(),
                    retry_in: None,
                });
                break;
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                task = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            self.event_tx.send_event(ExecutionEvent::AttemptFailed {
                task: id.to_string(),
                attempt,
                error: error.detail(),
                retry_in: Some(delay),
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.ctx.cancellation.cancelled() => break,
            }
        }

        records
    }

    /// One attempt, returning only once every storage worker it spawned has settled
    async fn attempt(&self) -> Result<TaskOutput, TaskError> {
        let ctx = self.ctx.for_attempt();
        let work = self.runner.run(&self.task, &ctx);
        let result = match self.task.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::Timeout(limit)),
                }
            }
            None => work.await,
        };

        // A timed-out worker keeps running until it rolls back
        ctx.workers.close();
        if !ctx.workers.is_empty() {
            warn!(task = %self.task.id, "waiting for abandoned attempt to roll back");
        }
        ctx.workers.wait().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::execution::report::AttemptOutcome;
    use crate::load::{LoadOutcome, LoadStrategy};
    use crate::record::{record, Value};
    use crate::source::JsonLinesReader;
    use crate::storage::{MemoryStorage, OnConflict, Statement, Storage};

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Runner with per-task scripted behaviour
    #[derive(Default)]
    struct Scripted {
        /// Fail the first N attempts with the given error
        failures: HashMap<String, (u32, TaskError)>,
        delays: HashMap<String, Duration>,
        cancel_after: Option<String>,
        panic_on: Option<String>,
        calls: Mutex<HashMap<String, u32>>,
        /// Start and finish of each task's last attempt
        spans: Mutex<HashMap<String, (tokio::time::Instant, tokio::time::Instant)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Scripted {
        fn failing(mut self, id: &str, times: u32, error: TaskError) -> Self {
            self.failures.insert(id.to_string(), (times, error));
            self
        }

        fn slow(mut self, id: &str, delay: Duration) -> Self {
            self.delays.insert(id.to_string(), delay);
            self
        }

        fn calls(&self, id: &str) -> u32 {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }

        fn span(&self, id: &str) -> (tokio::time::Instant, tokio::time::Instant) {
            self.spans.lock().unwrap()[id]
        }
    }

    #[async_trait]
    impl TaskRunner for Scripted {
        async fn run(&self, task: &TaskDef, ctx: &ExecutionContext) -> Result<TaskOutput, TaskError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(task.id.clone()).or_insert(0);
                *n += 1;
                *n
            };

            if self.panic_on.as_deref() == Some(task.id.as_str()) {
                panic!("boom");
            }

            let started = tokio::time::Instant::now();
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&task.id) {
                tokio::time::sleep(*delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.spans
                .lock()
                .unwrap()
                .insert(task.id.clone(), (started, tokio::time::Instant::now()));

            if self.cancel_after.as_deref() == Some(task.id.as_str()) {
                ctx.cancellation.cancel();
            }

            match self.failures.get(&task.id) {
                Some((times, error)) if call <= *times => Err(error.clone()),
                _ => Ok(TaskOutput::Barrier),
            }
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            "test",
            Arc::new(MemoryStorage::new()),
            Arc::new(JsonLinesReader::new(".")),
        )
    }

    fn fast_retry(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, 1, 4)
    }

    fn executor(runner: Arc<Scripted>, retries: u32) -> PipelineExecutor {
        PipelineExecutor::new(ExecutorConfig {
            max_concurrency: 0,
            default_retry: fast_retry(retries),
        })
        .with_runner(runner)
    }

    fn graph(tasks: Vec<TaskDef>) -> TaskGraph {
        TaskGraph::build(tasks).unwrap()
    }

    #[tokio::test]
    async fn test_all_tasks_succeed() {
        let runner = Arc::new(Scripted::default());
        let graph = graph(vec![
            TaskDef::barrier("a"),
            TaskDef::barrier("b").depends_on(["a"]),
        ]);

        let report = executor(runner.clone(), 0).run(&graph, context()).await;

        assert_eq!(report.outcome(), PipelineOutcome::Success);
        assert_eq!(report.entries().len(), 2);
        assert_eq!(report.entries()[0].task, "a");
        assert_eq!(runner.calls("b"), 1);
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents_only() {
        let runner = Arc::new(Scripted::default().failing("b", u32::MAX, TaskError::permanent("bad row")));
        let graph = graph(vec![
            TaskDef::barrier("a"),
            TaskDef::barrier("b").depends_on(["a"]),
            TaskDef::barrier("c").depends_on(["b"]),
            TaskDef::barrier("d"),
        ]);

        let report = executor(runner.clone(), 3).run(&graph, context()).await;

        assert_eq!(report.outcome(), PipelineOutcome::Failure);
        assert_eq!(report.final_state("a"), TaskState::Succeeded);
        assert_eq!(report.final_state("b"), TaskState::Failed);
        assert_eq!(report.final_state("c"), TaskState::Skipped);
        assert_eq!(report.final_state("d"), TaskState::Succeeded);

        // Permanent errors are never retried
        assert_eq!(runner.calls("b"), 1);
        assert_eq!(runner.calls("c"), 0);

        let skipped = report.last_entry("c").unwrap();
        assert_eq!(skipped.outcome, AttemptOutcome::Skipped);
        assert_eq!(skipped.upstream.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_root_failure_skips_whole_chain() {
        let runner = Arc::new(Scripted::default().failing("a", u32::MAX, TaskError::permanent("corrupt file")));
        let graph = graph(vec![
            TaskDef::barrier("a"),
            TaskDef::barrier("b").depends_on(["a"]),
            TaskDef::barrier("c").depends_on(["b"]),
            TaskDef::barrier("d"),
        ]);

        let report = executor(runner.clone(), 3).run(&graph, context()).await;

        assert_eq!(report.outcome(), PipelineOutcome::Failure);
        assert_eq!(report.final_state("a"), TaskState::Failed);
        assert_eq!(report.final_state("d"), TaskState::Succeeded);
        assert_eq!(runner.calls("a"), 1);
        for id in ["b", "c"] {
            let entry = report.last_entry(id).unwrap();
            assert_eq!(entry.outcome, AttemptOutcome::Skipped);
            assert_eq!(entry.upstream.as_deref(), Some("a"));
            assert_eq!(runner.calls(id), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_batch_waits_for_whole_earlier_batch() {
        let runner = Arc::new(Scripted::default().slow("slow", Duration::from_millis(50)));
        let graph = graph(vec![
            TaskDef::barrier("slow"),
            TaskDef::barrier("fast"),
            TaskDef::barrier("after").depends_on(["fast"]),
        ]);
        assert_eq!(graph.topological_batches().len(), 2);

        let report = executor(runner.clone(), 0).run(&graph, context()).await;
        assert!(report.is_success());

        let (_, slow_done) = runner.span("slow");
        let (_, fast_done) = runner.span("fast");
        let (after_start, _) = runner.span("after");
        assert!(fast_done < slow_done);
        assert!(after_start >= slow_done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_is_running_while_attempt_is_in_flight() {
        let runner = Arc::new(Scripted::default().slow("load", Duration::from_millis(100)));
        let states = Arc::new(Mutex::new(TaskStates::new(["load"])));
        let attempts = TaskAttempts {
            task: TaskDef::barrier("load"),
            policy: RetryPolicy::none(),
            runner: runner.clone(),
            ctx: context(),
            semaphore: None,
            event_tx: None,
            states: Arc::clone(&states),
        };

        let handle = tokio::spawn(attempts.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(states.lock().unwrap().get("load"), Some(TaskState::Running));

        let records = handle.await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AttemptOutcome::Succeeded);
    }

    /// Writes one row per call; the first call outlives the task timeout
    #[derive(Clone, Default)]
    struct SlowFirstLoad {
        calls: Arc<AtomicUsize>,
    }

    impl LoadStrategy for SlowFirstLoad {
        fn target(&self) -> &str {
            "plays"
        }

        fn load(
            &self,
            storage: &mut dyn Storage,
            _ctx: &ExecutionContext,
        ) -> Result<LoadOutcome, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            let key = vec!["id".to_string()];
            storage.execute(&Statement::CreateRelation {
                relation: "plays",
                columns: &key,
                key: Some(&key),
            })?;
            let mut outcome = LoadOutcome::new("plays");
            outcome.rows_written = storage.execute(&Statement::Insert {
                relation: "plays",
                record: &record([("id", Value::Int(call))]),
                on_conflict: OnConflict::DoNothing(&key),
            })?;
            if call == 1 {
                std::thread::sleep(Duration::from_millis(1500));
            }
            Ok(outcome)
        }
    }

    struct LoadRunner(SlowFirstLoad);

    #[async_trait]
    impl TaskRunner for LoadRunner {
        async fn run(&self, _task: &TaskDef, ctx: &ExecutionContext) -> Result<TaskOutput, TaskError> {
            crate::load::execute(&self.0, ctx).await.map(TaskOutput::Load)
        }
    }

    #[tokio::test]
    async fn test_timed_out_load_rolls_back_before_retry() {
        let storage = MemoryStorage::new();
        let ctx = ExecutionContext::new(
            "test",
            Arc::new(storage.clone()),
            Arc::new(JsonLinesReader::new(".")),
        );
        let load = SlowFirstLoad::default();
        let graph = graph(vec![TaskDef::barrier("plays")
            .with_timeout_secs(1)
            .with_retry(fast_retry(2))]);

        let report = PipelineExecutor::new(ExecutorConfig::default())
            .with_runner(Arc::new(LoadRunner(load.clone())))
            .run(&graph, ctx)
            .await;

        assert!(report.is_success());
        assert_eq!(report.attempts_for("plays"), 2);
        assert_eq!(report.entries()[0].error_kind, Some(ErrorKind::Transient));
        assert_eq!(load.calls.load(Ordering::SeqCst), 2);

        // The abandoned first attempt has rolled back; only the retry's row remains
        assert_eq!(
            storage.rows("plays"),
            Some(vec![record([("id", Value::Int(2))])])
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.rows("plays").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_uses_full_budget() {
        let runner = Arc::new(Scripted::default().failing("load", u32::MAX, TaskError::transient("busy")));
        let graph = graph(vec![TaskDef::barrier("load")]);

        let report = executor(runner.clone(), 2).run(&graph, context()).await;

        assert_eq!(runner.calls("load"), 3);
        assert_eq!(report.attempts_for("load"), 3);
        assert_eq!(report.final_state("load"), TaskState::Failed);
        let attempts: Vec<u32> = report.entries().iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let runner = Arc::new(Scripted::default().failing("load", 2, TaskError::transient("reset")));
        let graph = graph(vec![TaskDef::barrier("load").with_retry(fast_retry(5))]);

        let report = executor(runner.clone(), 0).run(&graph, context()).await;

        assert_eq!(report.outcome(), PipelineOutcome::Success);
        assert_eq!(report.attempts_for("load"), 3);
        assert_eq!(report.summarize().tasks[0].state, TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let runner = Arc::new(Scripted::default().slow("slow", Duration::from_secs(30)));
        let graph = graph(vec![TaskDef::barrier("slow").with_timeout_secs(1)]);

        let report = executor(runner.clone(), 1).run(&graph, context()).await;

        assert_eq!(runner.calls("slow"), 2);
        assert_eq!(report.final_state("slow"), TaskState::Failed);
        let last = report.last_entry("slow").unwrap();
        assert_eq!(last.error_kind, Some(ErrorKind::Transient));
        assert!(last.detail.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_before_start_skips_everything() {
        let runner = Arc::new(Scripted::default());
        let graph = graph(vec![TaskDef::barrier("a"), TaskDef::barrier("b").depends_on(["a"])]);
        let ctx = context();
        ctx.cancellation.cancel();

        let report = executor(runner.clone(), 0).run(&graph, ctx).await;

        assert!(report.cancelled);
        assert_eq!(report.outcome(), PipelineOutcome::Failure);
        assert_eq!(runner.calls("a"), 0);
        assert_eq!(report.final_state("a"), TaskState::Skipped);
        assert_eq!(report.last_entry("b").unwrap().detail.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_later_batches() {
        let runner = Arc::new(Scripted {
            cancel_after: Some("a".to_string()),
            ..Default::default()
        });
        let graph = graph(vec![TaskDef::barrier("a"), TaskDef::barrier("b").depends_on(["a"])]);

        let report = executor(runner.clone(), 0).run(&graph, context()).await;

        // In-flight work finishes, nothing new starts
        assert_eq!(report.final_state("a"), TaskState::Succeeded);
        assert_eq!(report.final_state("b"), TaskState::Skipped);
        assert_eq!(runner.calls("b"), 0);
        assert!(report.summarize().cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let delay = Duration::from_millis(50);
        let runner = Arc::new(
            Scripted::default()
                .slow("a", delay)
                .slow("b", delay)
                .slow("c", delay)
                .slow("d", delay),
        );
        let graph = graph(["a", "b", "c", "d"].into_iter().map(TaskDef::barrier).collect());

        let executor = PipelineExecutor::new(ExecutorConfig {
            max_concurrency: 2,
            default_retry: RetryPolicy::none(),
        })
        .with_runner(runner.clone());
        let report = executor.run(&graph, context()).await;

        assert!(report.is_success());
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_task_is_permanent_failure() {
        let runner = Arc::new(Scripted {
            panic_on: Some("boom".to_string()),
            ..Default::default()
        });
        let graph = graph(vec![
            TaskDef::barrier("boom"),
            TaskDef::barrier("after").depends_on(["boom"]),
        ]);

        let report = executor(runner, 3).run(&graph, context()).await;

        assert_eq!(report.final_state("boom"), TaskState::Failed);
        assert_eq!(
            report.last_entry("boom").unwrap().error_kind,
            Some(ErrorKind::Permanent)
        );
        assert_eq!(report.final_state("after"), TaskState::Skipped);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let runner = Arc::new(Scripted::default());
        let graph = graph(vec![TaskDef::barrier("only")]);

        executor(runner, 0).with_progress(tx).run(&graph, context()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                ExecutionEvent::PipelineStarted { .. } => "pipeline_started",
                ExecutionEvent::BatchStarted { .. } => "batch_started",
                ExecutionEvent::TaskStarted { .. } => "task_started",
                ExecutionEvent::TaskCompleted { .. } => "task_completed",
                ExecutionEvent::PipelineCompleted { .. } => "pipeline_completed",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "pipeline_started",
                "batch_started",
                "task_started",
                "task_completed",
                "pipeline_completed"
            ]
        );
    }
}
