use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::errors::SchedulerError;
use crate::executor::Dispatcher;
use crate::hub::ProgressHub;
use crate::scheduler::store::TaskStore;
use crate::scheduler::sweeper;
use crate::scheduler::task::{JsonObject, Task, TaskKind, TaskStatus};

/// Handle executors use to surface progress for the task they are running.
///
/// Owns clones of the store and hub handles plus the task id; the executor
/// never sees the stored record itself and cannot retain it.
pub struct ProgressReporter {
    store: Arc<TaskStore>,
    hub: Arc<ProgressHub>,
    task_id: String,
}

impl ProgressReporter {
    pub fn new(store: Arc<TaskStore>, hub: Arc<ProgressHub>, task_id: &str) -> Self {
        Self {
            store,
            hub,
            task_id: task_id.to_string(),
        }
    }

    /// Record a progress milestone and fan it out to subscribers.
    pub fn progress(&self, progress: u8, message: &str) {
        if let Err(e) = self.store.update_progress(&self.task_id, progress) {
            debug!(task_id = %self.task_id, error = %e, "progress update ignored");
            return;
        }
        self.hub.publish_progress(
            &self.task_id,
            progress,
            TaskStatus::Running.as_str(),
            message,
        );
    }

    /// Stream a line of executor commentary to subscribers.
    pub fn thought(&self, step: &str, thought: &str) {
        self.hub.publish_thought(&self.task_id, thought, step);
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// The task scheduler: admission queue + fixed worker pool.
///
/// Tasks are recorded in the [`TaskStore`] and their ids pushed through a
/// bounded queue; each of N workers dequeues an id, marks the task
/// running, dispatches it, and records the outcome. The queue bounds how
/// far submission can run ahead of execution; the worker count bounds how
/// many tasks are ever `running` at once.
pub struct TaskScheduler {
    store: Arc<TaskStore>,
    hub: Arc<ProgressHub>,
    dispatcher: Arc<Dispatcher>,
    cfg: SchedulerConfig,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        store: Arc<TaskStore>,
        hub: Arc<ProgressHub>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_capacity());
        Arc::new(Self {
            store,
            hub,
            dispatcher,
            cfg,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker pool and the retention sweeper.
    pub async fn start(self: &Arc<Self>) {
        info!(workers = self.cfg.workers, "starting task scheduler");
        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.cfg.workers {
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(scheduler.worker_loop(worker_id)));
        }
        handles.push(tokio::spawn(sweeper::run(
            Arc::clone(&self.store),
            self.cfg.result_retention_secs,
            self.cfg.sweep_interval(),
            self.shutdown.clone(),
        )));
    }

    /// Stop accepting signals to the workers and wait for them to finish.
    ///
    /// Queued-but-undequeued tasks stay pending; tasks already running are
    /// allowed to finish.
    pub async fn shutdown(&self) {
        info!("stopping task scheduler");
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked during shutdown");
            }
        }
        info!("task scheduler stopped");
    }

    /// Create a task and enqueue it for execution.
    ///
    /// The enqueue is bounded: if no queue slot frees up within the
    /// configured submit timeout the record is rolled back and the caller
    /// gets a saturation error instead of an unbounded background retry.
    pub async fn submit(
        &self,
        kind: TaskKind,
        name: &str,
        description: &str,
        params: JsonObject,
    ) -> Result<Task, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let task = self.store.create(kind, name, description, params);

        let enqueue = self.queue_tx.send(task.id.clone());
        match tokio::time::timeout(self.cfg.submit_timeout(), enqueue).await {
            Ok(Ok(())) => {
                debug!(task_id = %task.id, "task enqueued");
                Ok(task)
            }
            Ok(Err(_)) => {
                // Queue closed: the scheduler is gone.
                self.store.remove(&task.id);
                Err(SchedulerError::ShuttingDown)
            }
            Err(_) => {
                self.store.remove(&task.id);
                info!(task_id = %task.id, "admission queue saturated, rejecting task");
                Err(SchedulerError::QueueSaturated)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Task, SchedulerError> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<Task> {
        self.store.list()
    }

    /// Result of a completed task; an error for any other state.
    pub fn get_result(&self, id: &str) -> Result<JsonObject, SchedulerError> {
        let task = self.store.get(id)?;
        if task.status != TaskStatus::Completed {
            return Err(SchedulerError::NotCompleted {
                id: id.to_string(),
                status: task.status,
            });
        }
        Ok(task.result.unwrap_or_default())
    }

    /// Cancel a pending task. Running and finished tasks are rejected.
    pub fn cancel(&self, id: &str) -> Result<Task, SchedulerError> {
        self.store.cancel(id)
    }

    pub fn running_count(&self) -> usize {
        self.store.running_count()
    }

    /// Tasks currently waiting in the admission queue.
    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    pub fn worker_count(&self) -> usize {
        self.cfg.workers
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "task worker started");
        loop {
            // Biased so a stop signal wins over more queued work; queued
            // tasks must stay pending across shutdown.
            let task_id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                dequeued = async {
                    let mut queue = self.queue_rx.lock().await;
                    queue.recv().await
                } => match dequeued {
                    Some(id) => id,
                    None => break,
                },
            };
            self.process(&task_id).await;
        }
        debug!(worker_id, "task worker stopped");
    }

    /// Run one dequeued task to a terminal state.
    async fn process(&self, task_id: &str) {
        // A task cancelled while queued is still dequeued; the transition
        // guard is what keeps it from running.
        let snapshot = match self.store.transition_to_running(task_id) {
            Ok(task) => task,
            Err(e) => {
                debug!(task_id, error = %e, "skipping dequeued task");
                return;
            }
        };

        info!(task_id, kind = %snapshot.kind, "worker processing task");
        self.hub.publish_progress(
            task_id,
            0,
            TaskStatus::Running.as_str(),
            "task started",
        );

        let reporter =
            ProgressReporter::new(Arc::clone(&self.store), Arc::clone(&self.hub), task_id);
        let outcome = self.dispatcher.execute(&snapshot, &reporter).await;

        match outcome {
            Ok(result) => {
                if self.store.complete(task_id, result).is_ok() {
                    self.hub.publish_progress(
                        task_id,
                        100,
                        TaskStatus::Completed.as_str(),
                        "task completed",
                    );
                }
            }
            Err(e) => {
                let message = e.to_string();
                if self.store.fail(task_id, &message).is_ok() {
                    self.hub.publish_progress(
                        task_id,
                        100,
                        TaskStatus::Failed.as_str(),
                        &message,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    use crate::config::GitConfig;
    use crate::errors::AgentError;
    use crate::executor::{AgentApi, RepoService};

    /// Agent double that sleeps to simulate an external call.
    struct SlowAgent {
        delay: Duration,
    }

    #[async_trait]
    impl AgentApi for SlowAgent {
        async fn analyze(&self, _code: &str, _language: &str) -> Result<JsonObject, AgentError> {
            tokio::time::sleep(self.delay).await;
            let mut result = JsonObject::new();
            result.insert("ok".into(), json!(true));
            Ok(result)
        }

        async fn analyze_python2(&self, code: &str) -> Result<JsonObject, AgentError> {
            self.analyze(code, "python").await
        }

        async fn convert(
            &self,
            code: &str,
            _from: &str,
            _to: &str,
            _options: Option<JsonObject>,
        ) -> Result<JsonObject, AgentError> {
            self.analyze(code, "python").await
        }

        async fn generate_tests(
            &self,
            code: &str,
            _test_type: &str,
            _framework: &str,
        ) -> Result<JsonObject, AgentError> {
            self.analyze(code, "python").await
        }
    }

    fn scheduler_with(cfg: SchedulerConfig, agent_delay: Duration) -> Arc<TaskScheduler> {
        let store = Arc::new(TaskStore::new());
        let hub = Arc::new(ProgressHub::new(64));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SlowAgent { delay: agent_delay }),
            RepoService::new(GitConfig::default()),
        ));
        TaskScheduler::new(cfg, store, hub, dispatcher)
    }

    fn analysis_params() -> JsonObject {
        let mut params = JsonObject::new();
        params.insert("code".into(), json!("print(1)"));
        params
    }

    async fn wait_until_terminal(scheduler: &TaskScheduler, id: &str) -> Task {
        for _ in 0..200 {
            let task = scheduler.get(id).unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", id);
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let scheduler = scheduler_with(SchedulerConfig::default(), Duration::from_millis(10));
        scheduler.start().await;

        let task = scheduler
            .submit(TaskKind::Analysis, "analyze", "", analysis_params())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);

        let done = wait_until_terminal(&scheduler, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.result.is_some());
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        let result = scheduler.get_result(&task.id).unwrap();
        assert_eq!(result.get("ok"), Some(&json!(true)));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_result_before_completion_is_rejected() {
        let scheduler = scheduler_with(SchedulerConfig::default(), Duration::from_millis(10));
        // Not started: the task stays pending.
        let task = scheduler
            .submit(TaskKind::Analysis, "analyze", "", analysis_params())
            .await
            .unwrap();
        assert!(matches!(
            scheduler.get_result(&task.id),
            Err(SchedulerError::NotCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_cap_is_never_exceeded() {
        let cfg = SchedulerConfig {
            workers: 2,
            admission_slack: 4,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(cfg, Duration::from_millis(100));
        scheduler.start().await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let task = scheduler
                .submit(TaskKind::Analysis, &format!("t{}", i), "", analysis_params())
                .await
                .unwrap();
            ids.push(task.id);
        }

        // Sample while the pool churns: at most `workers` tasks running.
        let mut max_running = 0;
        for _ in 0..50 {
            max_running = max_running.max(scheduler.running_count());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(max_running <= 2, "observed {} running tasks", max_running);
        assert!(max_running >= 1);

        for id in &ids {
            let task = wait_until_terminal(&scheduler, id).await;
            assert_eq!(task.status, TaskStatus::Completed);
        }
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_saturated_queue_rejects_submit_and_rolls_back() {
        let cfg = SchedulerConfig {
            workers: 1,
            admission_slack: 1,
            submit_timeout_secs: 0,
            ..SchedulerConfig::default()
        };
        // No workers started: the queue (capacity 1) fills immediately.
        let scheduler = scheduler_with(cfg, Duration::from_millis(10));

        let first = scheduler
            .submit(TaskKind::Analysis, "first", "", analysis_params())
            .await
            .unwrap();

        let err = scheduler
            .submit(TaskKind::Analysis, "second", "", analysis_params())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::QueueSaturated));

        // The rejected submission left no record behind.
        let names: Vec<String> = scheduler.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["first".to_string()]);
        assert!(scheduler.get(&first.id).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_pending_then_worker_skips_it() {
        let cfg = SchedulerConfig {
            workers: 1,
            admission_slack: 4,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(cfg, Duration::from_millis(200));
        scheduler.start().await;

        // Occupy the single worker so the next task stays queued.
        let blocker = scheduler
            .submit(TaskKind::Analysis, "blocker", "", analysis_params())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let queued = scheduler
            .submit(TaskKind::Analysis, "queued", "", analysis_params())
            .await
            .unwrap();
        let cancelled = scheduler.cancel(&queued.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // The worker dequeues the cancelled id but must not run it.
        let done = wait_until_terminal(&scheduler, &blocker.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let still_cancelled = scheduler.get(&queued.id).unwrap();
        assert_eq!(still_cancelled.status, TaskStatus::Cancelled);
        assert_eq!(still_cancelled.progress, 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_is_rejected() {
        let scheduler = scheduler_with(SchedulerConfig::default(), Duration::from_millis(300));
        scheduler.start().await;

        let task = scheduler
            .submit(TaskKind::Analysis, "busy", "", analysis_params())
            .await
            .unwrap();
        // Wait for a worker to pick it up.
        for _ in 0..100 {
            if scheduler.get(&task.id).unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scheduler.get(&task.id).unwrap().status, TaskStatus::Running);

        let err = scheduler.cancel(&task.id).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_leaves_queued_tasks_pending() {
        let cfg = SchedulerConfig {
            workers: 1,
            admission_slack: 4,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(cfg, Duration::from_millis(100));
        scheduler.start().await;

        let running = scheduler
            .submit(TaskKind::Analysis, "running", "", analysis_params())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let queued = scheduler
            .submit(TaskKind::Analysis, "queued", "", analysis_params())
            .await
            .unwrap();

        scheduler.shutdown().await;

        // The in-flight task finished; the queued one was never started.
        assert_eq!(
            scheduler.get(&running.id).unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            scheduler.get(&queued.id).unwrap().status,
            TaskStatus::Pending
        );

        // Submitting after shutdown is refused.
        let err = scheduler
            .submit(TaskKind::Analysis, "late", "", analysis_params())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_failed_execution_records_error() {
        // git_diff with a bogus repo path fails inside the executor.
        let scheduler = scheduler_with(SchedulerConfig::default(), Duration::from_millis(10));
        scheduler.start().await;

        let mut params = JsonObject::new();
        params.insert("repo_path".into(), json!("/nonexistent/repo"));
        params.insert("file_path".into(), json!("main.py"));
        params.insert("from_commit".into(), json!("aaaaaaa"));
        let task = scheduler
            .submit(TaskKind::GitDiff, "diff", "", params)
            .await
            .unwrap();

        let done = wait_until_terminal(&scheduler, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.progress, 100);
        assert!(done.result.is_none());
        assert!(done.error.unwrap().contains("to_commit"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_depth_reports_waiting_tasks() {
        let cfg = SchedulerConfig {
            workers: 2,
            admission_slack: 2,
            ..SchedulerConfig::default()
        };
        // Workers not started; everything submitted sits in the queue.
        let scheduler = scheduler_with(cfg, Duration::from_millis(10));
        assert_eq!(scheduler.queue_depth(), 0);
        scheduler
            .submit(TaskKind::Analysis, "a", "", analysis_params())
            .await
            .unwrap();
        scheduler
            .submit(TaskKind::Analysis, "b", "", analysis_params())
            .await
            .unwrap();
        assert_eq!(scheduler.queue_depth(), 2);
        assert_eq!(scheduler.worker_count(), 2);
    }
}
