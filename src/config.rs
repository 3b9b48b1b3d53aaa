use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::types::{Issue, Stage};

/// Suffix that marks a project configuration document in the config directory.
pub const CONFIG_SUFFIX: &str = "-issues.json";

/// Default settings file name, looked up in the working directory.
pub const SETTINGS_FILE: &str = "wavecrew.toml";

// --- Project configuration document ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Gitlab,
    Github,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "issue-".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RepoConfig {
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Directory that holds one worktree per issue; `<path>-worktrees` when absent.
    #[serde(default)]
    pub worktree_base: Option<PathBuf>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub platform: Platform,
}

impl RepoConfig {
    pub fn worktree_base(&self) -> PathBuf {
        match &self.worktree_base {
            Some(base) => base.clone(),
            None => {
                let mut base = self.path.clone().into_os_string();
                base.push("-worktrees");
                PathBuf::from(base)
            }
        }
    }

    pub fn branch_for(&self, issue: u32) -> String {
        format!("{}{}", self.branch_prefix, issue)
    }

    pub fn worktree_for(&self, issue: u32) -> PathBuf {
        self.worktree_base().join(format!("issue-{}", issue))
    }

    /// Ref that new commits are measured against.
    pub fn base_ref(&self) -> String {
        format!("origin/{}", self.default_branch)
    }
}

/// Project facts injected into worker prompts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ProjectContext {
    pub language: String,
    pub build_command: String,
    pub test_command: String,
    pub safety_rules: Vec<String>,
    pub commit_prefix: String,
    pub key_files: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Tunables {
    pub max_retries: u32,
    /// Seconds without log growth before a running worker counts as stalled.
    pub stall_timeout: u64,
    /// Hard ceiling in seconds on a single run.
    pub wall_clock_timeout: u64,
    pub cycle_interval: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_retries: 10,
            stall_timeout: 900,
            wall_clock_timeout: 1800,
            cycle_interval: 60,
        }
    }
}

fn default_pipeline() -> Vec<Stage> {
    vec![Stage::Implement]
}

/// One project: its repositories, issues, pipeline and tunables.
///
/// Loaded from `<name>-issues.json`. The document on disk is the source of
/// truth for issue progress; this struct is a read snapshot of it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectConfig {
    pub project: String,
    #[serde(default)]
    pub repos: BTreeMap<String, RepoConfig>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<Stage>,
    #[serde(flatten)]
    pub tunables: Tunables,
    /// worker id -> issue number, honored by `launch`.
    #[serde(default)]
    pub initial_assignments: BTreeMap<u32, u32>,
    #[serde(default)]
    pub project_context: ProjectContext,
    /// Canonical document path; the configuration's identity.
    #[serde(skip)]
    pub path: PathBuf,
}

impl ProjectConfig {
    pub fn id(&self) -> &Path {
        &self.path
    }

    pub fn get_issue(&self, number: u32) -> Option<&Issue> {
        self.issues.iter().find(|i| i.number == number)
    }

    /// Repository for an issue: its named repo, else the first by name.
    pub fn repo_for(&self, issue: &Issue) -> Option<&RepoConfig> {
        issue
            .repo
            .as_ref()
            .and_then(|name| self.repos.get(name))
            .or_else(|| self.repos.values().next())
    }

    pub fn repo_for_number(&self, number: u32) -> Option<&RepoConfig> {
        match self.get_issue(number) {
            Some(issue) => self.repo_for(issue),
            None => self.repos.values().next(),
        }
    }

    pub fn stage_at(&self, index: usize) -> Option<Stage> {
        self.pipeline.get(index).copied()
    }

    /// True when `index` names a stage that has a successor.
    pub fn has_next_stage(&self, index: usize) -> bool {
        index + 1 < self.pipeline.len()
    }
}

/// Load a single project configuration document.
///
/// Relative repository paths resolve against the document's directory.
pub fn load_project(path: &Path) -> Result<ProjectConfig, FleetError> {
    let contents = std::fs::read_to_string(path).map_err(|source| FleetError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config: ProjectConfig =
        serde_json::from_str(&contents).map_err(|source| FleetError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    config.path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let base = config
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    for repo in config.repos.values_mut() {
        if repo.path.is_relative() {
            repo.path = base.join(&repo.path);
        }
        if let Some(wt) = &repo.worktree_base {
            if wt.is_relative() {
                repo.worktree_base = Some(base.join(wt));
            }
        }
    }

    Ok(config)
}

/// Load every `*-issues.json` in `dir`, sorted by file name.
///
/// The first configuration is the fleet's home configuration.
pub fn load_all_configs(dir: &Path) -> Result<Vec<ProjectConfig>, FleetError> {
    let entries = std::fs::read_dir(dir).map_err(|source| FleetError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CONFIG_SUFFIX))
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(FleetError::NoConfigs(dir.to_path_buf()));
    }

    paths.iter().map(|p| load_project(p)).collect()
}

// --- Orchestrator settings ---

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub num_workers: u32,
    /// Terminal session hosting one window per worker.
    pub session: String,
    pub state_root: PathBuf,
    /// Where signal, log and prompt files live.
    pub scratch_dir: PathBuf,
    /// Agent invocation; the prompt is appended as the last argument.
    pub agent_command: String,
    /// Process name matched when checking whether an agent is alive.
    pub agent_process: String,
    pub arbiter_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub interrupt_grace_secs: u64,
    pub stagger_delay_secs: u64,
    pub retry_phase_timeout_secs: u64,
    pub max_retry_rounds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_workers: 5,
            session: "wavecrew".to_string(),
            state_root: PathBuf::from(".wavecrew/state"),
            scratch_dir: PathBuf::from("/tmp"),
            agent_command: "claude -p --dangerously-skip-permissions".to_string(),
            agent_process: "claude".to_string(),
            arbiter_timeout_secs: 60,
            command_timeout_secs: 60,
            interrupt_grace_secs: 2,
            stagger_delay_secs: 30,
            retry_phase_timeout_secs: 900,
            max_retry_rounds: 1,
        }
    }
}

impl Settings {
    /// Directory holding durable state for a fleet whose home project is `project`.
    pub fn state_dir(&self, project: &str) -> PathBuf {
        self.state_root.join(project)
    }
}

pub fn validate_settings(settings: &Settings) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if settings.num_workers < 1 {
        errors.push("num_workers must be >= 1".to_string());
    }

    if settings.session.trim().is_empty() {
        errors.push("session must not be empty".to_string());
    }

    if settings.agent_command.trim().is_empty() {
        errors.push("agent_command must not be empty".to_string());
    }

    if settings.command_timeout_secs < 1 {
        errors.push("command_timeout_secs must be >= 1".to_string());
    }

    if settings.retry_phase_timeout_secs < 1 {
        errors.push("retry_phase_timeout_secs must be >= 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load settings from `path`, or from `wavecrew.toml` under `root`.
///
/// A missing file yields defaults; an explicit path that does not exist is an error.
pub fn load_settings(path: Option<&Path>, root: &Path) -> Result<Settings, FleetError> {
    let settings_path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default_path = root.join(SETTINGS_FILE);
            if !default_path.exists() {
                return Ok(Settings::default());
            }
            default_path
        }
    };

    let contents =
        std::fs::read_to_string(&settings_path).map_err(|source| FleetError::Read {
            path: settings_path.clone(),
            source,
        })?;

    let settings: Settings = toml::from_str(&contents).map_err(|source| FleetError::Settings {
        path: settings_path.clone(),
        source,
    })?;

    validate_settings(&settings).map_err(|errors| {
        FleetError::Invalid(
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(settings)
}
