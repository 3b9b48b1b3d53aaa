use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueStatus::Pending => write!(f, "pending"),
            IssueStatus::InProgress => write!(f, "in_progress"),
            IssueStatus::Completed => write!(f, "completed"),
            IssueStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Running,
    #[default]
    Idle,
    Failed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Pending => write!(f, "pending"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One named step of an issue pipeline.
///
/// The set is closed: a configuration naming anything else is rejected when
/// the document is parsed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Implement,
    Optimize,
    WriteTests,
    RunTestsFix,
    Document,
    Research,
    Draft,
    Validate,
    Review,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Implement,
        Stage::Optimize,
        Stage::WriteTests,
        Stage::RunTestsFix,
        Stage::Document,
        Stage::Research,
        Stage::Draft,
        Stage::Validate,
        Stage::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Implement => "implement",
            Stage::Optimize => "optimize",
            Stage::WriteTests => "write_tests",
            Stage::RunTestsFix => "run_tests_fix",
            Stage::Document => "document",
            Stage::Research => "research",
            Stage::Draft => "draft",
            Stage::Validate => "validate",
            Stage::Review => "review",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
                format!("Unknown pipeline stage '{}': expected one of {}", s, valid.join(", "))
            })
    }
}

/// What a worker is currently doing: a pipeline stage or a retry phase.
///
/// Persisted as a bare string (`"implement"`, `"retry_analyze"`, ...).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum WorkerStage {
    Pipeline(Stage),
    RetryAnalyze,
    RetryExplore,
}

impl WorkerStage {
    pub fn is_retry_phase(&self) -> bool {
        matches!(self, WorkerStage::RetryAnalyze | WorkerStage::RetryExplore)
    }
}

impl fmt::Display for WorkerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStage::Pipeline(stage) => f.write_str(stage.as_str()),
            WorkerStage::RetryAnalyze => f.write_str("retry_analyze"),
            WorkerStage::RetryExplore => f.write_str("retry_explore"),
        }
    }
}

impl TryFrom<String> for WorkerStage {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "retry_analyze" => Ok(WorkerStage::RetryAnalyze),
            "retry_explore" => Ok(WorkerStage::RetryExplore),
            other => other.parse().map(WorkerStage::Pipeline),
        }
    }
}

impl From<WorkerStage> for String {
    fn from(stage: WorkerStage) -> String {
        stage.to_string()
    }
}

// --- Issues and workers ---

fn default_priority() -> u32 {
    1
}

fn default_wave() -> u32 {
    99
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A unit of work, scoped to one project configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Issue {
    pub number: u32,
    #[serde(default)]
    pub title: String,
    /// Lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_wave")]
    pub wave: u32,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub pipeline_stage: usize,
    #[serde(default)]
    pub assigned_worker: Option<u32>,
    /// Repository name; the first repository when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// How many times the diagnose/explore retry workflow has been applied.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_rounds: u32,
}

impl Issue {
    pub fn new(number: u32, title: &str) -> Self {
        Self {
            number,
            title: title.to_string(),
            priority: default_priority(),
            wave: default_wave(),
            status: IssueStatus::Pending,
            depends_on: Vec::new(),
            pipeline_stage: 0,
            assigned_worker: None,
            repo: None,
            retry_rounds: 0,
        }
    }

    /// Scheduling order key: lower waves first, then lower priority values.
    pub fn sort_key(&self) -> (u32, u32) {
        (self.wave, self.priority)
    }
}

/// Durable per-worker record, one JSON file per worker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct Worker {
    pub worker_id: u32,
    pub issue_number: Option<u32>,
    pub branch: Option<String>,
    pub worktree: Option<PathBuf>,
    pub status: WorkerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_log_size: u64,
    pub retry_count: u32,
    pub commits: Vec<String>,
    pub stage: Option<WorkerStage>,
    /// Document path of the configuration that owns the current assignment.
    pub source_config: Option<PathBuf>,
}

impl Worker {
    pub fn idle(worker_id: u32) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    /// Drop the current assignment, keeping identity.
    pub fn release(&mut self, status: WorkerStatus) {
        self.status = status;
        self.issue_number = None;
        self.source_config = None;
        self.stage = None;
        self.retry_count = 0;
    }
}

// --- Observation ---

/// The arbiter's answer for an ambiguous success.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Retry,
}

/// Closed classification of a worker's log tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogClass {
    NoOutput,
    InfraError,
    MeaningfulOutput,
}

/// Point-in-time view of one worker, gathered before any decision is made.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WorkerSnapshot {
    pub worker_id: u32,
    pub status: WorkerStatus,
    pub issue_number: Option<u32>,
    pub retry_count: u32,
    pub process_alive: bool,
    /// Exit code from the signal file, when the run has finished.
    pub exit_code: Option<i32>,
    pub log_size: u64,
    pub log_mtime: Option<DateTime<Utc>>,
    pub log_tail: String,
    pub git_status: String,
    /// `git log --oneline` output for commits not yet on the default branch.
    pub new_commits: String,
    pub elapsed_seconds: Option<u64>,
    /// Filled in by the monitor when the arbiter was consulted.
    pub verdict: Option<Verdict>,
}

impl WorkerSnapshot {
    pub fn has_commits(&self) -> bool {
        !self.new_commits.trim().is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }

    pub fn commit_lines(&self) -> Vec<String> {
        self.new_commits
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect()
    }
}

// --- Decisions ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Noop,
    Push,
    MarkComplete,
    Reassign,
    ReassignCross,
    RetryFailed,
    Restart,
    AdvanceStage,
    Skip,
    Defer,
    Idle,
}

impl Action {
    /// Actions that settle the fate of the worker's current issue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::MarkComplete | Action::Skip | Action::Defer)
    }

    pub fn assigns_issue(&self) -> bool {
        matches!(
            self,
            Action::Reassign | Action::ReassignCross | Action::RetryFailed
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Noop => "noop",
            Action::Push => "push",
            Action::MarkComplete => "mark_complete",
            Action::Reassign => "reassign",
            Action::ReassignCross => "reassign_cross",
            Action::RetryFailed => "retry_failed",
            Action::Restart => "restart",
            Action::AdvanceStage => "advance_stage",
            Action::Skip => "skip",
            Action::Defer => "defer",
            Action::Idle => "idle",
        };
        f.write_str(s)
    }
}

/// One state transition for one worker, produced by the decision engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub worker_id: u32,
    pub issue_number: Option<u32>,
    pub new_issue: Option<u32>,
    pub reason: String,
    #[serde(default)]
    pub continuation: bool,
    #[serde(default)]
    pub source_config: Option<PathBuf>,
}

impl Decision {
    pub fn new(action: Action, worker_id: u32, issue_number: Option<u32>, reason: &str) -> Self {
        Self {
            action,
            worker_id,
            issue_number,
            new_issue: None,
            reason: reason.to_string(),
            continuation: false,
            source_config: None,
        }
    }

    pub fn with_new_issue(mut self, issue: u32, source_config: PathBuf) -> Self {
        self.new_issue = Some(issue);
        self.source_config = Some(source_config);
        self
    }

    pub fn with_source(mut self, source_config: PathBuf) -> Self {
        self.source_config = Some(source_config);
        self
    }

    pub fn with_continuation(mut self, continuation: bool) -> Self {
        self.continuation = continuation;
        self
    }
}
