#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use wavecrew::config::{
    load_project, Platform, ProjectConfig, ProjectContext, RepoConfig, Settings, Tunables,
};
use wavecrew::git::Vcs;
use wavecrew::tmux::Terminal;
use wavecrew::tracker::IssueTracker;
use wavecrew::types::{Issue, IssueStatus, Stage, Worker, WorkerSnapshot, WorkerStatus};

/// Creates a pending `Issue` with the given ordering and dependencies.
///
/// The title is auto-generated as `"Issue {number}"`.
pub fn make_issue(number: u32, wave: u32, priority: u32, depends_on: &[u32]) -> Issue {
    let mut issue = Issue::new(number, &format!("Issue {}", number));
    issue.wave = wave;
    issue.priority = priority;
    issue.depends_on = depends_on.to_vec();
    issue
}

pub fn with_status(mut issue: Issue, status: IssueStatus) -> Issue {
    issue.status = status;
    issue
}

pub fn make_repo(path: &Path) -> RepoConfig {
    RepoConfig {
        path: path.to_path_buf(),
        default_branch: "main".to_string(),
        worktree_base: None,
        branch_prefix: "issue-".to_string(),
        platform: Platform::Gitlab,
    }
}

/// In-memory project whose identity is `/configs/{name}-issues.json`.
///
/// Nothing is written to disk; use for pure decision and scheduling tests.
pub fn make_project(name: &str, issues: Vec<Issue>) -> ProjectConfig {
    ProjectConfig {
        project: name.to_string(),
        repos: BTreeMap::from([(
            "main".to_string(),
            make_repo(&PathBuf::from(format!("/repos/{}", name))),
        )]),
        issues,
        pipeline: vec![Stage::Implement],
        tunables: Tunables::default(),
        initial_assignments: BTreeMap::new(),
        project_context: ProjectContext::default(),
        path: PathBuf::from(format!("/configs/{}-issues.json", name)),
    }
}

/// Write a project configuration document into `dir` and load it back.
///
/// Creates a `repo/` directory next to the document so structural
/// validation passes.
pub fn write_project(dir: &Path, name: &str, issues: &[Issue], pipeline: &[Stage]) -> ProjectConfig {
    let repo_dir = dir.join(format!("{}-repo", name));
    fs::create_dir_all(&repo_dir).unwrap();

    let doc = serde_json::json!({
        "project": name,
        "repos": {
            "main": {
                "path": repo_dir,
                "worktree_base": dir.join(format!("{}-worktrees", name)),
            }
        },
        "issues": issues,
        "pipeline": pipeline,
        "max_retries": 10,
        "stall_timeout": 900,
        "wall_clock_timeout": 1800,
        "cycle_interval": 1,
    });
    let path = dir.join(format!("{}-issues.json", name));
    fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    load_project(&path).unwrap()
}

/// Settings pointing state and scratch files into `dir`, with no delays.
pub fn test_settings(dir: &Path, num_workers: u32) -> Settings {
    Settings {
        num_workers,
        session: "test".to_string(),
        state_root: dir.join("state"),
        scratch_dir: dir.join("scratch"),
        interrupt_grace_secs: 0,
        stagger_delay_secs: 0,
        arbiter_timeout_secs: 5,
        ..Settings::default()
    }
}

pub fn running_worker(worker_id: u32, issue: u32, config: &ProjectConfig) -> Worker {
    let mut worker = Worker::idle(worker_id);
    worker.issue_number = Some(issue);
    worker.status = WorkerStatus::Running;
    worker.source_config = Some(config.path.clone());
    worker
}

pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn secs_ago(seconds: i64) -> DateTime<Utc> {
    now() - Duration::seconds(seconds)
}

/// Snapshot of a running worker with a live process and recent output.
pub fn running_snapshot(worker_id: u32, issue: u32) -> WorkerSnapshot {
    WorkerSnapshot {
        worker_id,
        status: WorkerStatus::Running,
        issue_number: Some(issue),
        process_alive: true,
        log_size: 4096,
        log_mtime: Some(secs_ago(10)),
        log_tail: "compiling crate\nrunning tests".to_string(),
        elapsed_seconds: Some(300),
        ..Default::default()
    }
}

/// Snapshot of a worker whose run finished with `code`.
pub fn exited_snapshot(worker_id: u32, issue: u32, code: i32) -> WorkerSnapshot {
    WorkerSnapshot {
        process_alive: false,
        exit_code: Some(code),
        ..running_snapshot(worker_id, issue)
    }
}

pub fn idle_snapshot(worker_id: u32) -> WorkerSnapshot {
    WorkerSnapshot {
        worker_id,
        status: WorkerStatus::Idle,
        ..Default::default()
    }
}

/// A log tail long enough to count as meaningful output.
pub fn meaningful_tail() -> String {
    "error[E0308]: mismatched types in src/lib.rs while implementing the parser; \
     tried two approaches, both failed the borrow checker on the iterator adaptor. \
     Next step would be to restructure the tokenizer so it owns its buffer."
        .repeat(2)
}

// --- Mock adapters ---

/// Version-control mock. Records calls; `create_worktree` creates the directory.
#[derive(Default)]
pub struct MockVcs {
    pub calls: Mutex<Vec<String>>,
    /// Returned by `log_since`.
    pub commits: Mutex<String>,
    pub fail_push: bool,
    /// Deleted when a worktree is created, as if edited away mid-cycle.
    pub remove_on_worktree: Option<PathBuf>,
}

impl MockVcs {
    pub fn with_commits(commits: &str) -> Self {
        Self {
            commits: Mutex::new(commits.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Vcs for MockVcs {
    async fn fetch(&self, repo: &Path) -> Result<(), String> {
        self.record(format!("fetch {}", repo.display()));
        Ok(())
    }

    async fn branch_exists(&self, _repo: &Path, _branch: &str) -> bool {
        false
    }

    async fn create_worktree(
        &self,
        _repo: &RepoConfig,
        branch: &str,
        worktree: &Path,
    ) -> Result<(), String> {
        self.record(format!("worktree {}", branch));
        if let Some(path) = &self.remove_on_worktree {
            fs::remove_file(path).map_err(|e| e.to_string())?;
        }
        fs::create_dir_all(worktree).map_err(|e| e.to_string())
    }

    async fn remove_worktree(&self, _repo: &Path, worktree: &Path) -> Result<(), String> {
        self.record(format!("remove {}", worktree.display()));
        Ok(())
    }

    async fn push(&self, _worktree: &Path, branch: &str) -> Result<(), String> {
        self.record(format!("push {}", branch));
        if self.fail_push {
            Err("remote rejected".to_string())
        } else {
            Ok(())
        }
    }

    async fn status(&self, _worktree: &Path) -> Result<String, String> {
        Ok(String::new())
    }

    async fn log_since(&self, _worktree: &Path, _base_ref: &str) -> Result<String, String> {
        Ok(self.commits.lock().unwrap().clone())
    }

    async fn recent_log(&self, _worktree: &Path, _count: usize) -> Result<String, String> {
        Ok(self.commits.lock().unwrap().clone())
    }

    async fn diff_stat(&self, _worktree: &Path, _base_ref: &str) -> Result<String, String> {
        Ok(" src/lib.rs | 4 ++--".to_string())
    }
}

/// Terminal mock. Agents count as alive for targets in `alive`.
#[derive(Default)]
pub struct MockTerminal {
    pub alive: Mutex<HashSet<String>>,
    /// When set, `send_command` fails with this message and records nothing.
    pub fail_commands: Mutex<Option<String>>,
    pub commands: Mutex<Vec<(String, String)>>,
    pub interrupts: Mutex<Vec<String>>,
    pub windows: Mutex<Vec<String>>,
}

impl MockTerminal {
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_for(&self, target: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(t, _)| t == target)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn set_alive(&self, target: &str, alive: bool) {
        let mut set = self.alive.lock().unwrap();
        if alive {
            set.insert(target.to_string());
        } else {
            set.remove(target);
        }
    }
}

impl Terminal for MockTerminal {
    async fn session_exists(&self, _session: &str) -> bool {
        !self.windows.lock().unwrap().is_empty()
    }

    async fn create_session(&self, session: &str, first_window: &str) -> Result<(), String> {
        self.windows
            .lock()
            .unwrap()
            .push(format!("{}:{}", session, first_window));
        Ok(())
    }

    async fn new_window(&self, session: &str, name: &str) -> Result<(), String> {
        self.windows
            .lock()
            .unwrap()
            .push(format!("{}:{}", session, name));
        Ok(())
    }

    async fn send_command(&self, target: &str, command: &str) -> Result<(), String> {
        if let Some(message) = self.fail_commands.lock().unwrap().clone() {
            return Err(message);
        }
        self.commands
            .lock()
            .unwrap()
            .push((target.to_string(), command.to_string()));
        Ok(())
    }

    async fn send_interrupt(&self, target: &str) -> Result<(), String> {
        self.interrupts.lock().unwrap().push(target.to_string());
        Ok(())
    }

    async fn pane_pid(&self, _target: &str) -> Option<u32> {
        Some(4242)
    }

    async fn kill_session(&self, _session: &str) -> Result<(), String> {
        self.windows.lock().unwrap().clear();
        Ok(())
    }

    async fn agent_alive(&self, target: &str) -> bool {
        self.alive.lock().unwrap().contains(target)
    }
}

/// Tracker mock: fixed body, or failure when `fail` is set.
#[derive(Default)]
pub struct MockTracker {
    pub fail: bool,
    pub fetches: Mutex<Vec<u32>>,
}

impl IssueTracker for MockTracker {
    async fn fetch_body(&self, _repo: &RepoConfig, number: u32) -> Result<String, String> {
        self.fetches.lock().unwrap().push(number);
        if self.fail {
            Err("tracker unreachable".to_string())
        } else {
            Ok(format!("Body of issue {}", number))
        }
    }
}
