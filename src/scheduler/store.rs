use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::SchedulerError;
use crate::scheduler::task::{JsonObject, Task, TaskKind, TaskStatus, is_valid_transition};

/// Authoritative in-memory map of task id → task record.
///
/// All reads and updates go through these synchronized methods; callers
/// receive cloned snapshots, never references into the map, so no lock is
/// ever held across an await point. Designed to be wrapped in `Arc` and
/// shared between the API handlers, the worker pool and the sweeper.
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    // A poisoned lock only means some writer panicked mid-call; the map
    // itself is still usable, so recover the guard instead of unwinding
    // every caller.
    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, Task>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a new pending task and return a snapshot of it.
    pub fn create(
        &self,
        kind: TaskKind,
        name: &str,
        description: &str,
        params: JsonObject,
    ) -> Task {
        let task = Task::new(kind, name, description, params);
        info!(task_id = %task.id, kind = %task.kind, name, "task created");
        self.write_guard().insert(task.id.clone(), task.clone());
        task
    }

    pub fn get(&self, id: &str) -> Result<Task, SchedulerError> {
        self.read_guard()
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    /// Snapshot every known task. Order is unspecified; callers sort.
    pub fn list(&self) -> Vec<Task> {
        self.read_guard().values().cloned().collect()
    }

    /// Mark a pending task as running and stamp `started_at`.
    pub fn transition_to_running(&self, id: &str) -> Result<Task, SchedulerError> {
        self.mutate(id, TaskStatus::Running, |task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        })
    }

    /// Advance progress on a running task. Progress never decreases; stale
    /// or out-of-order updates are clamped to the current value.
    pub fn update_progress(&self, id: &str, progress: u8) -> Result<(), SchedulerError> {
        let mut tasks = self.write_guard();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        if task.status != TaskStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.progress = task.progress.max(progress.min(100));
        task.updated_at = Utc::now();
        debug!(task_id = id, progress = task.progress, "task progress updated");
        Ok(())
    }

    /// Record a successful result and mark the task completed.
    pub fn complete(&self, id: &str, result: JsonObject) -> Result<Task, SchedulerError> {
        let snapshot = self.mutate(id, TaskStatus::Completed, |task| {
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.progress = 100;
            task.completed_at = Some(Utc::now());
        })?;
        info!(task_id = id, "task completed");
        Ok(snapshot)
    }

    /// Record a failure message and mark the task failed.
    pub fn fail(&self, id: &str, error: &str) -> Result<Task, SchedulerError> {
        let snapshot = self.mutate(id, TaskStatus::Failed, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.progress = 100;
            task.completed_at = Some(Utc::now());
        })?;
        warn!(task_id = id, error, "task failed");
        Ok(snapshot)
    }

    /// Cancel a pending task. Running and terminal tasks are rejected.
    pub fn cancel(&self, id: &str) -> Result<Task, SchedulerError> {
        let snapshot = self.mutate(id, TaskStatus::Cancelled, |task| {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
        })?;
        info!(task_id = id, "task cancelled");
        Ok(snapshot)
    }

    /// Remove a record outright. Used to roll back a submission the
    /// admission queue refused. Returns true when a record was removed.
    pub fn remove(&self, id: &str) -> bool {
        self.write_guard().remove(id).is_some()
    }

    /// Delete every terminal task whose `completed_at` is older than the
    /// cutoff. Tasks without a `completed_at` are never swept. Returns the
    /// number of records deleted.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.write_guard();
        let before = tasks.len();
        tasks.retain(|_, task| match task.completed_at {
            Some(completed_at) => completed_at >= cutoff,
            None => true,
        });
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks currently in `running` state.
    pub fn running_count(&self) -> usize {
        self.read_guard()
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    fn mutate(
        &self,
        id: &str,
        to: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> Result<Task, SchedulerError> {
        let mut tasks = self.write_guard();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        if !is_valid_transition(&task.status, &to) {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to,
            });
        }
        apply(task);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
