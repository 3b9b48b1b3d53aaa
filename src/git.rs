use std::path::Path;
use std::time::Duration;

use crate::agent::run_captured;
use crate::config::RepoConfig;
use crate::log_debug;

/// Lines of `git status --short` kept in a snapshot.
const STATUS_MAX_LINES: usize = 10;

/// Commits shown when measuring new work against the base ref.
const LOG_SINCE_COUNT: usize = 5;

/// Version-control operations the monitor needs. Every method is bounded by
/// a timeout and reports failure as `Err`, never by panicking.
pub trait Vcs: Send + Sync {
    fn fetch(&self, repo: &Path) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn branch_exists(
        &self,
        repo: &Path,
        branch: &str,
    ) -> impl std::future::Future<Output = bool> + Send;

    /// Create (or reuse) the worktree for `branch` at `worktree`.
    fn create_worktree(
        &self,
        repo: &RepoConfig,
        branch: &str,
        worktree: &Path,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn remove_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn push(
        &self,
        worktree: &Path,
        branch: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Short working-tree status, capped at a few lines.
    fn status(&self, worktree: &Path)
        -> impl std::future::Future<Output = Result<String, String>> + Send;

    /// One-line log of commits on HEAD that are not on `base_ref`.
    fn log_since(
        &self,
        worktree: &Path,
        base_ref: &str,
    ) -> impl std::future::Future<Output = Result<String, String>> + Send;

    fn recent_log(
        &self,
        worktree: &Path,
        count: usize,
    ) -> impl std::future::Future<Output = Result<String, String>> + Send;

    fn diff_stat(
        &self,
        worktree: &Path,
        base_ref: &str,
    ) -> impl std::future::Future<Output = Result<String, String>> + Send;
}

/// `git` CLI implementation.
pub struct GitCli {
    pub timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, args: &[&str], dir: &Path) -> Result<String, String> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args).current_dir(dir);
        let label = format!("git {}", args.first().unwrap_or(&""));
        run_captured(cmd, &label, self.timeout).await
    }
}

fn path_str(path: &Path) -> Result<&str, String> {
    path.to_str()
        .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", path))
}

/// Keep the first `max` non-empty lines.
fn first_lines(text: &str, max: usize) -> String {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .take(max)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Vcs for GitCli {
    async fn fetch(&self, repo: &Path) -> Result<(), String> {
        self.run(&["fetch", "origin"], repo).await.map(|_| ())
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        self.run(&["rev-parse", "--verify", "--quiet", &reference], repo)
            .await
            .is_ok()
    }

    async fn create_worktree(
        &self,
        repo: &RepoConfig,
        branch: &str,
        worktree: &Path,
    ) -> Result<(), String> {
        if worktree.is_dir() {
            log_debug!("[git] Reusing worktree {}", worktree.display());
            return Ok(());
        }
        if let Some(parent) = worktree.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }

        if let Err(e) = self.fetch(&repo.path).await {
            log_debug!("[git] fetch failed, continuing with local refs: {}", e);
        }

        let wt = path_str(worktree)?;
        if self.branch_exists(&repo.path, branch).await {
            self.run(&["worktree", "add", wt, branch], &repo.path)
                .await
                .map(|_| ())
        } else {
            let base = repo.base_ref();
            self.run(&["worktree", "add", "-b", branch, wt, &base], &repo.path)
                .await
                .map(|_| ())
        }
    }

    async fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<(), String> {
        let wt = path_str(worktree)?;
        self.run(&["worktree", "remove", "--force", wt], repo)
            .await
            .map(|_| ())
    }

    async fn push(&self, worktree: &Path, branch: &str) -> Result<(), String> {
        self.run(&["push", "-u", "origin", branch], worktree)
            .await
            .map(|_| ())
    }

    async fn status(&self, worktree: &Path) -> Result<String, String> {
        let out = self.run(&["status", "--short"], worktree).await?;
        Ok(first_lines(&out, STATUS_MAX_LINES))
    }

    async fn log_since(&self, worktree: &Path, base_ref: &str) -> Result<String, String> {
        let range = format!("{}..HEAD", base_ref);
        let count = format!("-{}", LOG_SINCE_COUNT);
        let out = self
            .run(&["log", "--oneline", &count, &range], worktree)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn recent_log(&self, worktree: &Path, count: usize) -> Result<String, String> {
        let count = format!("-{}", count);
        let out = self.run(&["log", "--oneline", &count], worktree).await?;
        Ok(out.trim().to_string())
    }

    async fn diff_stat(&self, worktree: &Path, base_ref: &str) -> Result<String, String> {
        let out = self
            .run(&["diff", "--stat", base_ref], worktree)
            .await?;
        Ok(out.trim().to_string())
    }
}
