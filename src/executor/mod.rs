//! Executor dispatch — routes a task to the strategy for its kind.
//!
//! Every executor follows the same contract: validate required params
//! first (a missing or mistyped key fails the task immediately, before any
//! progress is emitted), publish coarse milestone progress while working,
//! perform the external call under that kind's timeout, and hand back a
//! JSON object result. Executors operate on a snapshot plus a
//! [`ProgressReporter`] handle; they never hold a reference to the stored
//! record.

pub mod agent;
pub mod repo;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::errors::ExecutorError;
use crate::scheduler::service::ProgressReporter;
use crate::scheduler::task::{JsonObject, Task, TaskKind};

pub use agent::{AgentApi, AgentClient};
pub use repo::RepoService;

/// Simulated per-file pacing for batch processing.
const BATCH_STEP_DELAY: Duration = Duration::from_millis(50);

/// Maps a task's kind to its execution strategy.
pub struct Dispatcher {
    agent: Arc<dyn AgentApi>,
    repo: RepoService,
}

impl Dispatcher {
    pub fn new(agent: Arc<dyn AgentApi>, repo: RepoService) -> Self {
        Self { agent, repo }
    }

    pub async fn execute(
        &self,
        task: &Task,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        debug!(task_id = %task.id, kind = %task.kind, "dispatching task");
        match task.kind {
            TaskKind::Analysis => self.run_analysis(&task.params, reporter).await,
            TaskKind::Conversion => self.run_conversion(&task.params, reporter).await,
            TaskKind::TestGeneration => self.run_test_generation(&task.params, reporter).await,
            TaskKind::Batch => self.run_batch(&task.params, reporter).await,
            TaskKind::GitClone => self.run_git_clone(&task.params, reporter).await,
            TaskKind::GitAnalyze => self.run_git_analyze(&task.params, reporter).await,
            TaskKind::GitHistory => self.run_git_history(&task.params, reporter).await,
            TaskKind::GitDiff => self.run_git_diff(&task.params, reporter).await,
        }
    }

    async fn run_analysis(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let code = required_str(params, "code")?;
        let language = optional_str(params, "language", "python");
        let python2 = params.get("python2_analysis").and_then(Value::as_bool) == Some(true);

        reporter.progress(20, "parameters validated");
        reporter.thought("analyze", "submitting code to the analysis agent");
        reporter.progress(40, "waiting for the analysis agent");

        let result = if python2 && language == "python" {
            self.agent.analyze_python2(code).await?
        } else {
            self.agent.analyze(code, &language).await?
        };

        reporter.progress(80, "analysis response received");
        Ok(result)
    }

    async fn run_conversion(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let code = required_str(params, "code")?;
        let from_version = optional_str(params, "from_version", "python2");
        let to_version = optional_str(params, "to_version", "python3");
        let options = params
            .get("options")
            .and_then(Value::as_object)
            .cloned();

        reporter.progress(20, "parameters validated");
        reporter.thought(
            "convert",
            &format!("converting {} to {}", from_version, to_version),
        );
        reporter.progress(40, "waiting for the conversion agent");

        let result = self
            .agent
            .convert(code, &from_version, &to_version, options)
            .await?;

        reporter.progress(80, "conversion response received");
        Ok(result)
    }

    async fn run_test_generation(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let code = required_str(params, "code")?;
        let test_type = optional_str(params, "test_type", "unit");
        let framework = optional_str(params, "framework", "pytest");

        reporter.progress(20, "parameters validated");
        reporter.progress(40, "waiting for the test-generation agent");

        let result = self
            .agent
            .generate_tests(code, &test_type, &framework)
            .await?;

        reporter.progress(80, "test generation response received");
        Ok(result)
    }

    async fn run_batch(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let file_ids = required_str_list(params, "file_ids")?;
        info!(files = file_ids.len(), "processing batch task");

        for (i, file_id) in file_ids.iter().enumerate() {
            debug!(file_id = %file_id, "processing batch file {}/{}", i + 1, file_ids.len());
            tokio::time::sleep(BATCH_STEP_DELAY).await;
            let progress = ((i + 1) * 100 / file_ids.len()) as u8;
            reporter.progress(progress, &format!("processed {}/{} files", i + 1, file_ids.len()));
        }

        Ok(object(json!({
            "processed_files": file_ids.len(),
            "file_ids": file_ids,
            "status": "completed",
        })))
    }

    async fn run_git_clone(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let remote_url = required_str(params, "remote_url")?;
        let target_path = required_str(params, "target_path")?;

        reporter.progress(20, "starting clone");
        self.repo
            .clone_repository(remote_url, Path::new(target_path))
            .await?;

        Ok(object(json!({
            "status": "success",
            "remote_url": remote_url,
            "target_path": target_path,
            "message": "Repository cloned successfully",
        })))
    }

    async fn run_git_analyze(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let repo_path = required_str(params, "repo_path")?;

        // Clone-if-missing is delegated to the clone path before analysis.
        let clone_if_missing =
            params.get("clone_if_not_exists").and_then(Value::as_bool) == Some(true);
        if clone_if_missing
            && let Some(remote_url) = params.get("remote_url").and_then(Value::as_str)
            && !Path::new(repo_path).exists()
        {
            reporter.progress(10, "cloning missing repository");
            self.repo
                .clone_repository(remote_url, Path::new(repo_path))
                .await?;
        }

        reporter.progress(20, "opening repository");
        reporter.thought("git_analyze", "walking commit history and source files");

        let analysis = self.repo.analyze(Path::new(repo_path)).await?;
        reporter.progress(80, "repository analysis complete");

        Ok(object(json!({
            "status": "success",
            "analysis": analysis,
            "message": "Repository analyzed successfully",
        })))
    }

    async fn run_git_history(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let repo_path = required_str(params, "repo_path")?;
        let file_path = required_str(params, "file_path")?;

        reporter.progress(30, "reading file history");
        let history = self
            .repo
            .file_history(Path::new(repo_path), file_path)
            .await?;

        Ok(object(json!({
            "status": "success",
            "repo_path": repo_path,
            "file_path": file_path,
            "count": history.len(),
            "history": history,
        })))
    }

    async fn run_git_diff(
        &self,
        params: &JsonObject,
        reporter: &ProgressReporter,
    ) -> Result<JsonObject, ExecutorError> {
        let repo_path = required_str(params, "repo_path")?;
        let file_path = required_str(params, "file_path")?;
        let from_commit = required_str(params, "from_commit")?;
        let to_commit = required_str(params, "to_commit")?;

        reporter.progress(40, "computing diff");
        let diff = self
            .repo
            .diff(Path::new(repo_path), file_path, from_commit, to_commit)
            .await?;

        Ok(object(json!({
            "status": "success",
            "repo_path": repo_path,
            "file_path": file_path,
            "from_commit": from_commit,
            "to_commit": to_commit,
            "diff": diff,
        })))
    }
}

// ── Param helpers ────────────────────────────────────────────────────

fn required_str<'a>(
    params: &'a JsonObject,
    name: &'static str,
) -> Result<&'a str, ExecutorError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ExecutorError::InvalidParam { name })
}

fn optional_str(params: &JsonObject, name: &str, default: &str) -> String {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn required_str_list(
    params: &JsonObject,
    name: &'static str,
) -> Result<Vec<String>, ExecutorError> {
    let values = params
        .get(name)
        .and_then(Value::as_array)
        .ok_or(ExecutorError::InvalidParam { name })?;
    if values.is_empty() {
        return Err(ExecutorError::InvalidParam { name });
    }
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or(ExecutorError::InvalidParam { name })
        })
        .collect()
}

fn object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}
