//! Carries out decisions and retry-workflow steps.
//!
//! Every durable change goes through the store before the agent is
//! (re)launched, so a crash between the two leaves state that the next cycle
//! can reconcile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::agent::{
    build_launch_command, exit_sentinel, start_sentinel, Arbiter, LaunchSpec, LAUNCH_FAILED_EXIT,
};
use crate::config::{ProjectConfig, RepoConfig};
use crate::git::Vcs;
use crate::monitor::Fleet;
use crate::pipeline::{next_stage, RetryStep};
use crate::prompt::{self, PromptParams};
use crate::scheduler::owning_config;
use crate::store;
use crate::tmux::Terminal;
use crate::tracker::{issue_body, IssueTracker};
use crate::types::{
    Action, Decision, Issue, IssueStatus, Stage, Worker, WorkerStage, WorkerStatus,
};
use crate::{log_debug, log_info, log_warn};

/// Log lines handed to a restarted worker as its last output.
const CONTINUATION_TAIL_LINES: usize = 50;

/// Commits listed in a continuation prompt.
const CONTINUATION_COMMITS: usize = 10;

/// A worker's issue resolved against its configuration, with a fresh copy of
/// the issue record.
struct Assignment<'a> {
    config: &'a ProjectConfig,
    repo: &'a RepoConfig,
    issue: Issue,
    worktree: PathBuf,
    branch: String,
}

impl Assignment<'_> {
    fn params<'b>(&'b self, worker_id: u32, issue_body: &'b str) -> PromptParams<'b> {
        PromptParams {
            config: self.config,
            repo: self.repo,
            issue: &self.issue,
            worker_id,
            worktree: &self.worktree,
            branch: &self.branch,
            issue_body,
        }
    }

    fn current_stage(&self) -> Result<Stage, String> {
        self.config.stage_at(self.issue.pipeline_stage).ok_or_else(|| {
            format!(
                "Issue #{} is at stage index {} but {} has {} stage(s)",
                self.issue.number,
                self.issue.pipeline_stage,
                self.config.project,
                self.config.pipeline.len()
            )
        })
    }
}

impl<V, T, K, A> Fleet<V, T, K, A>
where
    V: Vcs,
    T: Terminal,
    K: IssueTracker,
    A: Arbiter,
{
    /// Apply one decision. Errors are reported, never raised past the cycle.
    pub async fn execute(&self, decision: &Decision) -> Result<(), String> {
        match decision.action {
            Action::Noop => Ok(()),
            Action::Push => self.push(decision).await,
            Action::MarkComplete => self.mark_complete(decision).await,
            Action::Reassign | Action::ReassignCross => self.assign(decision, false).await,
            Action::RetryFailed => self.assign(decision, true).await,
            Action::Restart => self.restart(decision).await,
            Action::AdvanceStage => self.advance_stage(decision).await,
            Action::Skip => self.settle(decision, IssueStatus::Failed).await,
            Action::Defer => self.settle(decision, IssueStatus::Pending).await,
            Action::Idle => self.release(decision.worker_id, WorkerStatus::Idle),
        }
    }

    /// Move a worker through the diagnose/explore retry workflow.
    pub async fn execute_retry_step(&self, worker_id: u32, step: RetryStep) -> Result<(), String> {
        let (timed_out, explore) = match step {
            RetryStep::Wait => return Ok(()),
            RetryStep::Explore { timed_out } => (timed_out, true),
            RetryStep::Resume { timed_out } => (timed_out, false),
        };

        let mut worker = self.store.load_or_idle(worker_id);
        let a = self.assignment(&worker)?;
        if timed_out {
            log_warn!("[W{}] Retry phase timed out; moving on", worker_id);
            self.interrupt_and_wait(worker_id).await;
        }
        let body = issue_body(&self.tracker, &self.store, a.repo, &a.issue).await;
        let params = a.params(worker_id, &body);

        if explore {
            let prompt = prompt::explore_prompt(&params);
            worker.stage = Some(WorkerStage::RetryExplore);
            worker.status = WorkerStatus::Running;
            worker.started_at = Some(Utc::now());
            self.store.save_worker(&worker).map_err(String::from)?;
            self.store.clear_signal(worker_id).map_err(String::from)?;
            return self
                .launch_agent(worker_id, &a, WorkerStage::RetryExplore, &prompt, true)
                .await;
        }

        let analysis = prompt::extract_retry_context(&self.store.read_log(worker_id));
        let stage = a.current_stage()?;
        let prompt = prompt::stage_prompt(&params, stage, Some(&analysis));
        worker.stage = Some(WorkerStage::Pipeline(stage));
        worker.status = WorkerStatus::Running;
        worker.retry_count = 0;
        worker.started_at = Some(Utc::now());
        self.store.save_worker(&worker).map_err(String::from)?;
        self.store.clear_signal(worker_id).map_err(String::from)?;
        log_info!(
            "[W{}] Resuming #{} at {} with failure analysis",
            worker_id,
            a.issue.number,
            stage
        );
        self.launch_agent(worker_id, &a, WorkerStage::Pipeline(stage), &prompt, false)
            .await
    }

    // --- Resolution ---

    fn resolve(
        &self,
        source: Option<&Path>,
        number: u32,
    ) -> Result<(&ProjectConfig, Issue), String> {
        let config = owning_config(&self.configs, source, number)
            .ok_or_else(|| format!("Issue #{} is not in any loaded configuration", number))?;
        let issue = store::read_issue(&config.path, number).map_err(String::from)?;
        Ok((config, issue))
    }

    fn assignment(&self, worker: &Worker) -> Result<Assignment<'_>, String> {
        let number = worker
            .issue_number
            .ok_or_else(|| format!("W{} has no assigned issue", worker.worker_id))?;
        let (config, issue) = self.resolve(worker.source_config.as_deref(), number)?;
        let repo = config
            .repo_for(&issue)
            .ok_or_else(|| format!("No repository configured for issue #{}", number))?;
        Ok(Assignment {
            config,
            repo,
            worktree: worker
                .worktree
                .clone()
                .unwrap_or_else(|| repo.worktree_for(number)),
            branch: worker
                .branch
                .clone()
                .unwrap_or_else(|| repo.branch_for(number)),
            issue,
        })
    }

    /// Issue named by a decision, with the document that owns it.
    fn decision_issue(&self, decision: &Decision) -> Result<(u32, &ProjectConfig), String> {
        let number = decision.issue_number.ok_or_else(|| {
            format!(
                "{} for W{} names no issue",
                decision.action, decision.worker_id
            )
        })?;
        let config = owning_config(&self.configs, decision.source_config.as_deref(), number)
            .ok_or_else(|| format!("Issue #{} is not in any loaded configuration", number))?;
        Ok((number, config))
    }

    /// The worker's record, checked against the issue the decision was made for.
    fn worker_on(&self, decision: &Decision) -> Result<Worker, String> {
        let worker = self.store.load_or_idle(decision.worker_id);
        if decision.issue_number.is_some() && worker.issue_number != decision.issue_number {
            return Err(format!(
                "W{} moved from #{} before {} could run",
                decision.worker_id,
                decision.issue_number.unwrap_or_default(),
                decision.action
            ));
        }
        Ok(worker)
    }

    // --- Agent control ---

    /// Write the prompt and START sentinel, then send the command to the pane.
    ///
    /// If the command cannot be sent, the run is closed with an EXIT sentinel
    /// and a `LAUNCH_FAILED_EXIT` signal, so the next cycle sees a failed run
    /// instead of a finished one.
    async fn launch_agent(
        &self,
        worker_id: u32,
        a: &Assignment<'_>,
        stage: WorkerStage,
        prompt: &str,
        append: bool,
    ) -> Result<(), String> {
        let prompt_path = self
            .store
            .write_prompt(worker_id, prompt)
            .map_err(String::from)?;
        let start = start_sentinel(worker_id, a.issue.number, stage, Utc::now());
        self.store
            .begin_run(worker_id, &start, append)
            .map_err(String::from)?;

        let log_path = self.store.log_path(worker_id);
        let signal_path = self.store.signal_path(worker_id);
        let spec = LaunchSpec {
            worker_id,
            worktree: &a.worktree,
            prompt_path: &prompt_path,
            log_path: &log_path,
            signal_path: &signal_path,
        };
        let command = build_launch_command(&self.settings.agent_command, &spec);
        if let Err(e) = self.terminal.send_command(&self.target(worker_id), &command).await {
            self.abandon_run(worker_id);
            return Err(format!("Failed to launch agent for W{}: {}", worker_id, e));
        }
        log_debug!("[W{}] Launched {} for #{}", worker_id, stage, a.issue.number);
        Ok(())
    }

    /// Close a run whose command never reached the pane.
    fn abandon_run(&self, worker_id: u32) {
        let exit = exit_sentinel(worker_id, LAUNCH_FAILED_EXIT, Utc::now());
        if let Err(e) = self.store.append_log(worker_id, &exit) {
            log_warn!("[W{}] Could not close abandoned run in log: {}", worker_id, e);
        }
        if let Err(e) = self.store.write_signal(worker_id, LAUNCH_FAILED_EXIT) {
            log_warn!("[W{}] Could not record failed launch: {}", worker_id, e);
        }
    }

    async fn interrupt(&self, worker_id: u32) {
        if let Err(e) = self.terminal.send_interrupt(&self.target(worker_id)).await {
            log_debug!("[W{}] Interrupt failed: {}", worker_id, e);
        }
    }

    /// Interrupt, then give the agent the grace period to exit.
    async fn interrupt_and_wait(&self, worker_id: u32) {
        self.interrupt(worker_id).await;
        if self.settings.interrupt_grace_secs > 0 {
            tokio::time::sleep(Duration::from_secs(self.settings.interrupt_grace_secs)).await;
        }
    }

    async fn continuation(&self, worker_id: u32, a: &Assignment<'_>) -> String {
        let base = a.repo.base_ref();
        let recent = self
            .vcs
            .recent_log(&a.worktree, CONTINUATION_COMMITS)
            .await
            .unwrap_or_default();
        let diff = self
            .vcs
            .diff_stat(&a.worktree, &base)
            .await
            .unwrap_or_default();
        let status = self.vcs.status(&a.worktree).await.unwrap_or_default();
        let tail = self.store.log_tail(worker_id, CONTINUATION_TAIL_LINES);
        prompt::continuation_context(&recent, &diff, &status, &tail)
    }

    // --- Actions ---

    async fn push(&self, decision: &Decision) -> Result<(), String> {
        let worker = self.worker_on(decision)?;
        let (Some(worktree), Some(branch)) = (&worker.worktree, &worker.branch) else {
            return Err(format!("W{} has no worktree to push", decision.worker_id));
        };
        self.vcs
            .push(worktree, branch)
            .await
            .map_err(|e| format!("git push failed: {}", e))?;
        log_info!("[exec] W{}: pushed {}", decision.worker_id, branch);
        Ok(())
    }

    async fn mark_complete(&self, decision: &Decision) -> Result<(), String> {
        let w = decision.worker_id;
        let (number, config) = self.decision_issue(decision)?;

        self.interrupt(w).await;
        store::update_issue_status(&config.path, number, IssueStatus::Completed, None)
            .map_err(String::from)?;
        self.store.clear_signal(w).map_err(String::from)?;

        let mut worker = self.store.load_or_idle(w);
        if worker.issue_number == Some(number) {
            if let (Some(worktree), Some(repo)) =
                (worker.worktree.take(), config.repo_for_number(number))
            {
                if let Err(e) = self.vcs.remove_worktree(&repo.path, &worktree).await {
                    log_warn!("[W{}] Could not remove worktree for #{}: {}", w, number, e);
                }
            }
            worker.branch = None;
        }
        worker.release(WorkerStatus::Idle);
        self.store.save_worker(&worker).map_err(String::from)?;
        log_info!("[exec] #{} completed", number);
        Ok(())
    }

    /// Skip (issue failed) or defer (issue back to pending), freeing the worker.
    async fn settle(&self, decision: &Decision, status: IssueStatus) -> Result<(), String> {
        let w = decision.worker_id;
        let (number, config) = self.decision_issue(decision)?;

        self.interrupt(w).await;
        let worker_status = if status == IssueStatus::Failed {
            match self.store.archive_failure_log(w, number) {
                Ok(path) => log_info!("[W{}] Archived log to {}", w, path.display()),
                Err(e) => log_warn!("[W{}] Failed to archive log for #{}: {}", w, number, e),
            }
            WorkerStatus::Failed
        } else {
            WorkerStatus::Idle
        };

        store::update_issue_status(&config.path, number, status, None).map_err(String::from)?;
        self.store.clear_signal(w).map_err(String::from)?;
        self.release(w, worker_status)
    }

    fn release(&self, worker_id: u32, status: WorkerStatus) -> Result<(), String> {
        let mut worker = self.store.load_or_idle(worker_id);
        worker.release(status);
        self.store.save_worker(&worker).map_err(String::from)
    }

    async fn assign(&self, decision: &Decision, retry: bool) -> Result<(), String> {
        let w = decision.worker_id;
        let number = decision
            .new_issue
            .ok_or_else(|| format!("{} for W{} names no new issue", decision.action, w))?;
        let (config, issue) = self.resolve(decision.source_config.as_deref(), number)?;
        let repo = config
            .repo_for(&issue)
            .ok_or_else(|| format!("No repository configured for issue #{}", number))?;
        let branch = repo.branch_for(number);
        let worktree = repo.worktree_for(number);

        self.vcs
            .create_worktree(repo, &branch, &worktree)
            .await
            .map_err(|e| format!("Failed to prepare worktree for #{}: {}", number, e))?;

        let a = Assignment {
            config,
            repo,
            issue,
            worktree,
            branch,
        };
        let stage = if retry {
            store::bump_retry_rounds(&config.path, number).map_err(String::from)?;
            WorkerStage::RetryAnalyze
        } else {
            WorkerStage::Pipeline(a.current_stage()?)
        };

        // The document claims the issue first: a worker record naming an issue
        // that is still pending would let the next cycle hand it out again.
        store::update_issue_status(&config.path, number, IssueStatus::InProgress, Some(w))
            .map_err(String::from)?;

        let mut worker = self.store.load_or_idle(w);
        worker.issue_number = Some(number);
        worker.branch = Some(a.branch.clone());
        worker.worktree = Some(a.worktree.clone());
        worker.status = WorkerStatus::Running;
        worker.started_at = Some(Utc::now());
        worker.retry_count = 0;
        worker.last_log_size = 0;
        worker.commits.clear();
        worker.stage = Some(stage);
        worker.source_config = Some(config.path.clone());
        if let Err(e) = self.store.save_worker(&worker) {
            let back = if retry { IssueStatus::Failed } else { IssueStatus::Pending };
            if let Err(undo) = store::update_issue_status(&config.path, number, back, None) {
                log_warn!("[W{}] Could not release #{} after failed assignment: {}", w, number, undo);
            }
            return Err(format!("Failed to record W{} on #{}: {}", w, number, e));
        }
        self.store.clear_signal(w).map_err(String::from)?;

        let body = issue_body(&self.tracker, &self.store, repo, &a.issue).await;
        let params = a.params(w, &body);
        let prompt = match stage {
            WorkerStage::Pipeline(s) => prompt::stage_prompt(&params, s, None),
            _ => {
                let failure_log = self.store.failure_log_path(number);
                let failure_log = failure_log.exists().then_some(failure_log.as_path());
                prompt::failure_analysis_prompt(&params, failure_log)
            }
        };

        log_info!(
            "[exec] W{} → #{} ({}) in {}",
            w,
            number,
            stage,
            config.project
        );
        self.launch_agent(w, &a, stage, &prompt, false).await
    }

    async fn restart(&self, decision: &Decision) -> Result<(), String> {
        let w = decision.worker_id;
        let mut worker = self.worker_on(decision)?;
        let a = self.assignment(&worker)?;
        let stage = match worker.stage {
            Some(WorkerStage::Pipeline(stage)) => stage,
            _ => a.current_stage()?,
        };

        // Gathered before the relaunch truncates the log.
        let extra = if decision.continuation {
            Some(self.continuation(w, &a).await)
        } else {
            None
        };
        let body = issue_body(&self.tracker, &self.store, a.repo, &a.issue).await;
        let prompt = prompt::stage_prompt(&a.params(w, &body), stage, extra.as_deref());

        // started_at is kept: the wall-clock ceiling covers every retry of a stage.
        worker.retry_count += 1;
        worker.status = WorkerStatus::Running;
        worker.stage = Some(WorkerStage::Pipeline(stage));
        worker.started_at.get_or_insert_with(Utc::now);
        self.store.save_worker(&worker).map_err(String::from)?;

        self.interrupt_and_wait(w).await;
        self.store.clear_signal(w).map_err(String::from)?;
        self.launch_agent(w, &a, WorkerStage::Pipeline(stage), &prompt, false)
            .await
    }

    async fn advance_stage(&self, decision: &Decision) -> Result<(), String> {
        let w = decision.worker_id;
        let mut worker = self.worker_on(decision)?;
        let mut a = self.assignment(&worker)?;
        let Some((index, WorkerStage::Pipeline(stage))) = next_stage(a.config, &a.issue) else {
            return Err(format!(
                "Issue #{} has no stage after index {}",
                a.issue.number, a.issue.pipeline_stage
            ));
        };

        store::set_pipeline_stage(&a.config.path, a.issue.number, index).map_err(String::from)?;
        a.issue.pipeline_stage = index;

        worker.retry_count = 0;
        worker.status = WorkerStatus::Running;
        worker.started_at = Some(Utc::now());
        worker.stage = Some(WorkerStage::Pipeline(stage));
        self.store.save_worker(&worker).map_err(String::from)?;

        self.interrupt_and_wait(w).await;
        self.store.clear_signal(w).map_err(String::from)?;

        let body = issue_body(&self.tracker, &self.store, a.repo, &a.issue).await;
        let prompt = prompt::stage_prompt(&a.params(w, &body), stage, None);
        log_info!("[exec] #{} advanced to {}", a.issue.number, stage);
        self.launch_agent(w, &a, WorkerStage::Pipeline(stage), &prompt, true)
            .await
    }
}
