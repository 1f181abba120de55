use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::{BranchType, DiffFormat, DiffOptions, Oid, Repository};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::GitConfig;
use crate::errors::ExecutorError;

/// Thin wrapper over libgit2 for the repository-inspection task kinds.
///
/// libgit2 is synchronous, so every operation runs on the blocking pool
/// under a per-operation deadline.
#[derive(Clone)]
pub struct RepoService {
    cfg: GitConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoAnalysis {
    pub repository: RepositoryInfo,
    pub commits: Vec<CommitInfo>,
    pub contributors: BTreeMap<String, ContributorStats>,
    pub branches: Vec<BranchInfo>,
    pub files: FileCensus,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryInfo {
    pub current_branch: String,
    pub current_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContributorStats {
    pub name: String,
    pub email: String,
    pub commit_count: usize,
    pub first_commit: DateTime<Utc>,
    pub last_commit: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub name: String,
    pub hash: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileCensus {
    pub total_files: usize,
    pub language_totals: BTreeMap<String, usize>,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub language: String,
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileHistoryEntry {
    pub commit_hash: String,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub lines: usize,
}

impl RepoService {
    pub fn new(cfg: GitConfig) -> Self {
        Self { cfg }
    }

    /// Clone a repository to a path that must not already exist.
    pub async fn clone_repository(&self, url: &str, target: &Path) -> Result<(), ExecutorError> {
        if target.exists() {
            return Err(ExecutorError::Repository(format!(
                "target path already exists: {}",
                target.display()
            )));
        }
        if let Some(parent) = target.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        info!(url, target = %target.display(), "cloning repository");
        let url = url.to_string();
        let target = target.to_path_buf();
        run_blocking("git clone", self.cfg.clone_timeout(), move || {
            Repository::clone(&url, &target)?;
            Ok(())
        })
        .await
    }

    /// Full repository analysis: HEAD, branches, remote, commit history,
    /// contributor aggregation, and an on-disk source-file census.
    pub async fn analyze(&self, repo_path: &Path) -> Result<RepoAnalysis, ExecutorError> {
        let path = repo_path.to_path_buf();
        let cfg = self.cfg.clone();
        run_blocking("repository analysis", self.cfg.analyze_timeout(), move || {
            analyze_sync(&path, &cfg)
        })
        .await
    }

    /// Every commit in which the given file exists, newest first.
    pub async fn file_history(
        &self,
        repo_path: &Path,
        file_path: &str,
    ) -> Result<Vec<FileHistoryEntry>, ExecutorError> {
        let path = repo_path.to_path_buf();
        let file = file_path.to_string();
        run_blocking("file history", self.cfg.history_timeout(), move || {
            file_history_sync(&path, &file)
        })
        .await
    }

    /// Patch-format diff of one file between two commits.
    pub async fn diff(
        &self,
        repo_path: &Path,
        file_path: &str,
        from_commit: &str,
        to_commit: &str,
    ) -> Result<String, ExecutorError> {
        let path = repo_path.to_path_buf();
        let file = file_path.to_string();
        let from = from_commit.to_string();
        let to = to_commit.to_string();
        run_blocking("file diff", self.cfg.diff_timeout(), move || {
            diff_sync(&path, &file, &from, &to)
        })
        .await
    }
}

/// Run blocking git work with a deadline. On timeout the wait is
/// abandoned; the blocking task itself runs to completion on the pool.
async fn run_blocking<T, F>(
    what: &'static str,
    timeout: Duration,
    f: F,
) -> Result<T, ExecutorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExecutorError> + Send + 'static,
{
    let work = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, work).await {
        Err(_) => Err(ExecutorError::Timeout {
            what,
            seconds: timeout.as_secs(),
        }),
        Ok(Err(join_err)) => Err(ExecutorError::Internal(join_err.to_string())),
        Ok(Ok(result)) => result,
    }
}

fn analyze_sync(repo_path: &Path, cfg: &GitConfig) -> Result<RepoAnalysis, ExecutorError> {
    let repo = Repository::open(repo_path)?;

    let head = repo.head()?;
    let head_commit = head.peel_to_commit()?;
    let remote_url = repo
        .find_remote("origin")
        .ok()
        .and_then(|r| r.url().map(|u| u.to_string()));
    let repository = RepositoryInfo {
        current_branch: head.shorthand().unwrap_or("HEAD").to_string(),
        current_commit: head_commit.id().to_string(),
        remote_url,
    };

    let mut commits = Vec::new();
    let mut contributors: BTreeMap<String, ContributorStats> = BTreeMap::new();
    let mut revwalk = repo.revwalk()?;
    revwalk.push_head()?;
    for oid in revwalk {
        let commit = repo.find_commit(oid?)?;
        let author = commit.author();
        let name = author.name().unwrap_or("").to_string();
        let email = author.email().unwrap_or("").to_string();
        let timestamp = commit_timestamp(commit.time());

        contributors
            .entry(format!("{} <{}>", name, email))
            .and_modify(|stats| {
                stats.commit_count += 1;
                stats.first_commit = stats.first_commit.min(timestamp);
                stats.last_commit = stats.last_commit.max(timestamp);
            })
            .or_insert_with(|| ContributorStats {
                name: name.clone(),
                email: email.clone(),
                commit_count: 1,
                first_commit: timestamp,
                last_commit: timestamp,
            });

        commits.push(CommitInfo {
            hash: commit.id().to_string(),
            author: name,
            email,
            message: commit.message().unwrap_or("").trim().to_string(),
            timestamp,
        });
    }

    let mut branches = Vec::new();
    for branch in repo.branches(Some(BranchType::Local))? {
        let (branch, _) = branch?;
        let name = branch.name()?.unwrap_or("").to_string();
        let hash = branch
            .get()
            .target()
            .map(|oid| oid.to_string())
            .unwrap_or_default();
        branches.push(BranchInfo {
            is_current: branch.is_head(),
            name,
            hash,
        });
    }

    let files = census_files(repo_path, cfg);

    Ok(RepoAnalysis {
        repository,
        commits,
        contributors,
        branches,
        files,
        analyzed_at: Utc::now(),
    })
}

/// Walk the working tree and tally source files by language. Hidden
/// entries (including `.git`), disallowed extensions, oversized and
/// unreadable files are skipped.
fn census_files(repo_path: &Path, cfg: &GitConfig) -> FileCensus {
    let mut census = FileCensus {
        total_files: 0,
        language_totals: BTreeMap::new(),
        files: Vec::new(),
    };

    let walker = WalkDir::new(repo_path)
        .into_iter()
        .filter_entry(|e| !is_hidden(e));
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!(".{}", ext),
            None => continue,
        };
        if !cfg.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > cfg.max_file_size {
            warn!(path = %path.display(), size, "file too large, skipping");
            continue;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read file, skipping");
                continue;
            }
        };

        let language = language_by_extension(&ext).to_string();
        census.total_files += 1;
        *census.language_totals.entry(language.clone()).or_insert(0) += 1;
        census.files.push(FileInfo {
            path: path.display().to_string(),
            name: entry.file_name().to_string_lossy().to_string(),
            size,
            language,
            lines: content.split('\n').count(),
        });
    }

    census
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

fn language_by_extension(ext: &str) -> &'static str {
    match ext {
        ".py" => "Python",
        ".js" => "JavaScript",
        ".java" => "Java",
        ".cpp" => "C++",
        ".c" => "C",
        ".go" => "Go",
        ".rs" => "Rust",
        ".ts" => "TypeScript",
        _ => "Unknown",
    }
}

fn file_history_sync(
    repo_path: &Path,
    file_path: &str,
) -> Result<Vec<FileHistoryEntry>, ExecutorError> {
    let repo = Repository::open(repo_path)?;
    let mut revwalk = repo.revwalk()?;
    revwalk.push_head()?;

    let mut history = Vec::new();
    for oid in revwalk {
        let commit = repo.find_commit(oid?)?;
        let tree = commit.tree()?;
        // Commits that do not contain the file are skipped, not an error.
        let entry = match tree.get_path(Path::new(file_path)) {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let blob = repo.find_blob(entry.id())?;
        let lines = String::from_utf8_lossy(blob.content()).split('\n').count();

        history.push(FileHistoryEntry {
            commit_hash: commit.id().to_string(),
            author: commit.author().name().unwrap_or("").to_string(),
            message: commit.message().unwrap_or("").trim().to_string(),
            timestamp: commit_timestamp(commit.time()),
            lines,
        });
    }

    Ok(history)
}

fn diff_sync(
    repo_path: &Path,
    file_path: &str,
    from_commit: &str,
    to_commit: &str,
) -> Result<String, ExecutorError> {
    let repo = Repository::open(repo_path)?;
    let from_tree = repo.find_commit(Oid::from_str(from_commit)?)?.tree()?;
    let to_tree = repo.find_commit(Oid::from_str(to_commit)?)?.tree()?;

    let file = Path::new(file_path);
    if from_tree.get_path(file).is_err() && to_tree.get_path(file).is_err() {
        return Err(ExecutorError::Repository(format!(
            "file {} not found in either commit",
            file_path
        )));
    }

    let mut opts = DiffOptions::new();
    opts.pathspec(file_path);
    let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), Some(&mut opts))?;

    let mut patch = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => patch.push(line.origin()),
            _ => {}
        }
        patch.push_str(&String::from_utf8_lossy(line.content()));
        true
    })?;

    Ok(patch)
}

fn commit_timestamp(time: git2::Time) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(time.seconds(), 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn service() -> RepoService {
        RepoService::new(GitConfig::default())
    }

    /// Initialize a repo and commit `content` at `rel_path`, returning the
    /// commit id.
    fn commit_file(repo: &Repository, rel_path: &str, content: &str, message: &str) -> Oid {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(rel_path), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel_path)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Ada Tester", "ada@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    fn fixture_repo() -> (TempDir, Repository, Oid, Oid) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let first = commit_file(&repo, "main.py", "print('hello')\n", "initial commit");
        let second = commit_file(
            &repo,
            "main.py",
            "print('hello')\nprint('world')\n",
            "add second line",
        );
        (dir, repo, first, second)
    }

    #[tokio::test]
    async fn test_analyze_collects_commits_and_contributors() {
        let (dir, _repo, _first, second) = fixture_repo();
        let analysis = service().analyze(dir.path()).await.unwrap();

        assert_eq!(analysis.commits.len(), 2);
        assert_eq!(analysis.commits[0].hash, second.to_string());
        assert_eq!(analysis.commits[0].author, "Ada Tester");
        assert_eq!(analysis.repository.current_commit, second.to_string());
        assert!(analysis.repository.remote_url.is_none());

        let stats = analysis
            .contributors
            .get("Ada Tester <ada@example.com>")
            .unwrap();
        assert_eq!(stats.commit_count, 2);
        assert!(stats.first_commit <= stats.last_commit);

        assert_eq!(analysis.branches.len(), 1);
        assert!(analysis.branches[0].is_current);
    }

    #[tokio::test]
    async fn test_analyze_census_counts_source_files() {
        let (dir, repo, ..) = fixture_repo();
        commit_file(&repo, "lib.rs", "fn main() {}\n", "add rust file");
        std::fs::write(dir.path().join("notes.txt"), "not code").unwrap();

        let analysis = service().analyze(dir.path()).await.unwrap();
        assert_eq!(analysis.files.total_files, 2);
        assert_eq!(analysis.files.language_totals.get("Python"), Some(&1));
        assert_eq!(analysis.files.language_totals.get("Rust"), Some(&1));
        // The .txt file and everything under .git are excluded.
        assert!(analysis.files.files.iter().all(|f| f.name != "notes.txt"));
    }

    #[tokio::test]
    async fn test_analyze_unreadable_path_errors() {
        let dir = TempDir::new().unwrap();
        let err = service().analyze(dir.path()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Git(_)));
    }

    #[tokio::test]
    async fn test_file_history_newest_first() {
        let (dir, _repo, first, second) = fixture_repo();
        let history = service()
            .file_history(dir.path(), "main.py")
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].commit_hash, second.to_string());
        assert_eq!(history[1].commit_hash, first.to_string());
        assert!(history[0].lines > history[1].lines);
    }

    #[tokio::test]
    async fn test_file_history_skips_commits_without_file() {
        let (dir, repo, ..) = fixture_repo();
        commit_file(&repo, "other.py", "pass\n", "unrelated file");
        let history = service()
            .file_history(dir.path(), "other.py")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_diff_between_commits() {
        let (dir, _repo, first, second) = fixture_repo();
        let patch = service()
            .diff(
                dir.path(),
                "main.py",
                &first.to_string(),
                &second.to_string(),
            )
            .await
            .unwrap();
        assert!(patch.contains("main.py"));
        assert!(patch.contains("+print('world')"));
    }

    #[tokio::test]
    async fn test_diff_unknown_file_errors() {
        let (dir, _repo, first, second) = fixture_repo();
        let err = service()
            .diff(
                dir.path(),
                "missing.py",
                &first.to_string(),
                &second.to_string(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.py"));
    }

    #[tokio::test]
    async fn test_diff_rejects_bad_commit_id() {
        let (dir, ..) = fixture_repo();
        let err = service()
            .diff(dir.path(), "main.py", "not-a-sha", "also-not-a-sha")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Git(_)));
    }

    #[tokio::test]
    async fn test_clone_from_local_source() {
        let (src, ..) = fixture_repo();
        let dst_root = TempDir::new().unwrap();
        let target = dst_root.path().join("clone");

        service()
            .clone_repository(src.path().to_str().unwrap(), &target)
            .await
            .unwrap();
        assert!(target.join(".git").exists());

        // Cloning onto an existing path is rejected.
        let err = service()
            .clone_repository(src.path().to_str().unwrap(), &target)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_run_blocking_timeout() {
        let err = run_blocking("sleepy op", Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
        assert!(err.to_string().contains("sleepy op"));
    }
}
