//! The monitor cycle: observe every worker, decide, act, repeat.
//!
//! Within a cycle all snapshots are collected before any decision is made,
//! and decisions share one claim set so no issue is handed out twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::agent::{is_shutdown_requested, Arbiter, ArbiterContext, ARBITER_LOG_CHARS};
use crate::config::{load_project, ProjectConfig, Settings};
use crate::decision::{compute_decisions, needs_arbitration, DecisionContext};
use crate::error::FleetError;
use crate::events::EventLog;
use crate::git::Vcs;
use crate::issues::{count_issues, IssueCounts};
use crate::pipeline::{retry_step, RetryStep};
use crate::scheduler::{
    next_available_issue_global, next_retriable_issue_global, owning_config, ClaimSet,
};
use crate::store::StateStore;
use crate::tmux::{window_name, window_target, Terminal};
use crate::tracker::IssueTracker;
use crate::types::{Action, Decision, Worker, WorkerSnapshot, WorkerStatus};
use crate::{log_debug, log_info, log_warn};

/// Log lines inspected per snapshot.
pub const SNAPSHOT_TAIL_LINES: usize = 20;

/// Log lines scanned for the arbiter excerpt.
const ARBITER_TAIL_LINES: usize = 200;

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    AllDone,
    ShutdownRequested,
    CycleLimit,
}

#[derive(Debug)]
pub struct RunSummary {
    pub cycles: u64,
    pub halt_reason: HaltReason,
    pub counts: IssueCounts,
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub decisions: Vec<Decision>,
    pub retry_steps: Vec<(u32, RetryStep)>,
    /// Decisions or retry steps whose side effects failed, with the error.
    pub failures: Vec<(u32, String)>,
    pub all_done: bool,
    pub counts: IssueCounts,
}

/// A fleet of workers over one or more project configurations.
///
/// The first configuration is the home configuration: it names the state
/// directory and decides whether a reassignment is local or cross-project.
pub struct Fleet<V, T, K, A> {
    pub configs: Vec<ProjectConfig>,
    pub settings: Settings,
    pub store: StateStore,
    pub events: EventLog,
    pub vcs: V,
    pub terminal: T,
    pub tracker: K,
    pub arbiter: A,
}

impl<V, T, K, A> Fleet<V, T, K, A>
where
    V: Vcs,
    T: Terminal,
    K: IssueTracker,
    A: Arbiter,
{
    pub fn new(
        configs: Vec<ProjectConfig>,
        settings: Settings,
        vcs: V,
        terminal: T,
        tracker: K,
        arbiter: A,
    ) -> Result<Self, FleetError> {
        let home = configs
            .first()
            .ok_or_else(|| FleetError::Invalid("no project configurations loaded".to_string()))?;
        let state_dir = settings.state_dir(&home.project);
        let store = StateStore::new(&state_dir, &settings.scratch_dir, &home.project);
        let events = EventLog::new(&store.event_log_path());

        Ok(Self {
            configs,
            settings,
            store,
            events,
            vcs,
            terminal,
            tracker,
            arbiter,
        })
    }

    pub(crate) fn target(&self, worker_id: u32) -> String {
        window_target(&self.settings.session, worker_id)
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout_secs)
    }

    fn worker_ids(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.settings.num_workers
    }

    fn cycle_interval(&self) -> Duration {
        let secs = self
            .configs
            .first()
            .map(|c| c.tunables.cycle_interval)
            .unwrap_or(60);
        Duration::from_secs(secs)
    }

    /// Re-read every configuration document. A document that fails to load
    /// keeps its previous in-memory copy.
    pub fn reload_configs(&mut self) {
        for config in self.configs.iter_mut() {
            match load_project(&config.path) {
                Ok(fresh) => *config = fresh,
                Err(e) => log_warn!(
                    "[cycle] Keeping previous copy of {}: {}",
                    config.path.display(),
                    e
                ),
            }
        }
    }

    pub fn counts(&self) -> IssueCounts {
        let mut total = IssueCounts::default();
        for config in &self.configs {
            total.add(count_issues(&config.issues));
        }
        total
    }

    /// Nothing is running and nothing can be started: no worker is busy, no
    /// issue is in progress, none is eligible and none is retriable.
    ///
    /// Pending issues whose dependencies failed do not keep the fleet alive.
    pub fn all_done(&self) -> bool {
        if self.counts().in_progress > 0 {
            return false;
        }
        let busy = self
            .worker_ids()
            .filter_map(|id| self.store.load_worker(id))
            .any(|w| w.status == WorkerStatus::Running);
        if busy {
            return false;
        }
        let claims = ClaimSet::new();
        next_available_issue_global(&self.configs, &claims, None).is_none()
            && next_retriable_issue_global(&self.configs, &claims, self.settings.max_retry_rounds)
                .is_none()
    }

    // --- Observation ---

    /// Observe one worker. Never fails: an observation that cannot be made
    /// is left empty.
    pub async fn collect_snapshot(&self, worker: &Worker, now: DateTime<Utc>) -> WorkerSnapshot {
        let id = worker.worker_id;

        if let Some(code) = self.store.recover_signal(id) {
            log_info!("[W{}] Recovered exit code {} from log sentinel", id, code);
            if let Err(e) = self.events.record_signal_recovery(id, code) {
                log_warn!("[W{}] Failed to record signal recovery: {}", id, e);
            }
        }

        let (log_size, log_mtime) = self.store.log_stats(id);
        let mut snapshot = WorkerSnapshot {
            worker_id: id,
            status: worker.status,
            issue_number: worker.issue_number,
            retry_count: worker.retry_count,
            process_alive: self.terminal.agent_alive(&self.target(id)).await,
            exit_code: self.store.read_signal(id),
            log_size,
            log_mtime,
            log_tail: self.store.log_tail(id, SNAPSHOT_TAIL_LINES),
            elapsed_seconds: worker
                .started_at
                .map(|started| (now - started).num_seconds().max(0) as u64),
            ..Default::default()
        };

        if let (Some(worktree), Some(issue)) = (&worker.worktree, worker.issue_number) {
            if worktree.is_dir() {
                let base_ref = owning_config(&self.configs, worker.source_config.as_deref(), issue)
                    .and_then(|c| c.repo_for_number(issue))
                    .map(|r| r.base_ref())
                    .unwrap_or_else(|| "origin/main".to_string());
                snapshot.git_status = self.vcs.status(worktree).await.unwrap_or_default();
                snapshot.new_commits = self
                    .vcs
                    .log_since(worktree, &base_ref)
                    .await
                    .unwrap_or_else(|e| {
                        log_debug!("[W{}] git log failed: {}", id, e);
                        String::new()
                    });
            }
        }

        if needs_arbitration(&snapshot) {
            snapshot.verdict = self.arbitrate(&snapshot).await;
        }

        snapshot
    }

    /// Ask the arbiter about an ambiguous clean exit. Failure or timeout means accept.
    async fn arbitrate(&self, snapshot: &WorkerSnapshot) -> Option<crate::types::Verdict> {
        let id = snapshot.worker_id;
        let tail = self.store.log_tail(id, ARBITER_TAIL_LINES);
        let count = tail.chars().count();
        let excerpt: String = tail
            .chars()
            .skip(count.saturating_sub(ARBITER_LOG_CHARS))
            .collect();
        let context = ArbiterContext {
            worker_id: id,
            issue_number: snapshot.issue_number.unwrap_or_default(),
            commits: snapshot.new_commits.clone(),
            log_excerpt: excerpt,
        };

        let timeout = Duration::from_secs(self.settings.arbiter_timeout_secs);
        match tokio::time::timeout(timeout, self.arbiter.resolve_ambiguous(&context)).await {
            Ok(Ok(verdict)) => {
                log_info!("[arbiter] W{}: {:?}", id, verdict);
                Some(verdict)
            }
            Ok(Err(e)) => {
                log_warn!("[arbiter] W{}: {}; accepting", id, e);
                None
            }
            Err(_) => {
                log_warn!(
                    "[arbiter] W{}: timed out after {}s; accepting",
                    id,
                    timeout.as_secs()
                );
                None
            }
        }
    }

    /// Keep `last_log_size` and `commits` on the worker record current.
    fn note_progress(&self, worker: &mut Worker, snapshot: &WorkerSnapshot) {
        let commits = snapshot.commit_lines();
        if worker.last_log_size == snapshot.log_size && worker.commits == commits {
            return;
        }
        worker.last_log_size = snapshot.log_size;
        worker.commits = commits;
        if let Err(e) = self.store.save_worker(worker) {
            log_warn!("[W{}] Failed to save progress: {}", worker.worker_id, e);
        }
    }

    // --- Cycle ---

    pub async fn run_cycle(&mut self, cycle: u64, now: DateTime<Utc>) -> CycleReport {
        log_info!("[cycle] ==== Cycle {} ====", cycle);
        self.reload_configs();

        let mut workers: Vec<Worker> = self
            .worker_ids()
            .map(|id| self.store.load_or_idle(id))
            .collect();
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in &workers {
            snapshots.push(self.collect_snapshot(worker, now).await);
        }
        for (worker, snapshot) in workers.iter_mut().zip(&snapshots) {
            self.note_progress(worker, snapshot);
        }

        let mut report = CycleReport::default();
        let mut claims = ClaimSet::new();

        for (worker, snapshot) in workers.iter().zip(&snapshots) {
            if let Some(step) =
                retry_step(snapshot, worker, self.settings.retry_phase_timeout_secs)
            {
                if step != RetryStep::Wait {
                    report.retry_steps.push((worker.worker_id, step));
                }
                continue;
            }

            let ctx = DecisionContext {
                configs: &self.configs,
                worker: Some(worker),
                claims: &claims,
                now,
                max_retry_rounds: self.settings.max_retry_rounds,
            };
            let decisions = compute_decisions(snapshot, &ctx);
            claims.record(&decisions);
            report.decisions.extend(decisions);
        }

        let actions: Vec<String> = report
            .decisions
            .iter()
            .filter(|d| d.action != Action::Noop)
            .map(|d| format!("W{}:{}", d.worker_id, d.action))
            .collect();
        log_info!(
            "[cycle] {} decision(s){}",
            report.decisions.len(),
            if actions.is_empty() {
                String::new()
            } else {
                format!(": {}", actions.join(", "))
            }
        );

        for &(worker_id, step) in &report.retry_steps {
            let issue = workers
                .iter()
                .find(|w| w.worker_id == worker_id)
                .and_then(|w| w.issue_number);
            log_info!("[W{}] Retry workflow step: {}", worker_id, step);
            let result = self.execute_retry_step(worker_id, step).await;
            if let Err(e) = self.events.record_retry_step(worker_id, issue, step) {
                log_warn!("[W{}] Failed to record retry step: {}", worker_id, e);
            }
            if let Err(e) = result {
                log_warn!("[W{}] Retry step {} failed: {}", worker_id, step, e);
                report.failures.push((worker_id, e));
            }
        }

        for decision in &report.decisions {
            if decision.action == Action::Noop {
                log_debug!("[W{}] noop: {}", decision.worker_id, decision.reason);
                continue;
            }
            log_info!(
                "[W{}] {}: {}",
                decision.worker_id,
                decision.action,
                decision.reason
            );
            let result = self.execute(decision).await;
            if let Err(e) = self.events.record_decision(decision, &result) {
                log_warn!("[W{}] Failed to record decision: {}", decision.worker_id, e);
            }
            if let Err(e) = result {
                log_warn!("[W{}] {} failed: {}", decision.worker_id, decision.action, e);
                report.failures.push((decision.worker_id, e));
            }
        }

        self.reload_configs();
        report.counts = self.counts();
        report.all_done = self.all_done();

        let summary = format!("Progress: {}", report.counts);
        log_info!("[cycle] {}", summary);
        if let Err(e) = self.events.record_cycle(cycle, &summary) {
            log_warn!("[cycle] Failed to record cycle: {}", e);
        }

        report
    }

    /// Run cycles until everything is done, shutdown is requested, or
    /// `max_cycles` have run.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        max_cycles: Option<u64>,
    ) -> Result<RunSummary, String> {
        self.store.init().map_err(String::from)?;
        log_info!(
            "[cycle] Monitor started ({} worker(s), {} configuration(s), every {}s)",
            self.settings.num_workers,
            self.configs.len(),
            self.cycle_interval().as_secs()
        );

        let mut cycle = 0;
        loop {
            if cancel.is_cancelled() || is_shutdown_requested() {
                return Ok(self.summary(cycle, HaltReason::ShutdownRequested));
            }

            cycle += 1;
            let report = self.run_cycle(cycle, Utc::now()).await;

            if report.all_done {
                log_info!("[cycle] All issues settled. Monitor shutting down.");
                if let Err(e) = self.events.append(serde_json::json!({
                    "type": "shutdown",
                    "reason": "all_done",
                })) {
                    log_warn!("[cycle] Failed to record shutdown: {}", e);
                }
                return Ok(self.summary(cycle, HaltReason::AllDone));
            }
            if max_cycles.is_some_and(|max| cycle >= max) {
                return Ok(self.summary(cycle, HaltReason::CycleLimit));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cycle_interval()) => {}
                _ = cancel.cancelled() => {
                    return Ok(self.summary(cycle, HaltReason::ShutdownRequested));
                }
            }
        }
    }

    fn summary(&self, cycles: u64, halt_reason: HaltReason) -> RunSummary {
        RunSummary {
            cycles,
            halt_reason,
            counts: self.counts(),
        }
    }

    // --- Launch ---

    /// Prepare the session and state, then start the initial assignments.
    pub async fn launch(&self) -> Result<(), String> {
        self.store.init().map_err(String::from)?;

        let session = &self.settings.session;
        if self.terminal.session_exists(session).await {
            log_info!("[launch] Reusing session '{}'", session);
        } else {
            self.terminal
                .create_session(session, &window_name(1))
                .await?;
            for id in self.worker_ids().skip(1) {
                self.terminal.new_window(session, &window_name(id)).await?;
            }
            log_info!(
                "[launch] Created session '{}' with {} window(s)",
                session,
                self.settings.num_workers
            );
        }

        for id in self.worker_ids() {
            if self.store.load_worker(id).is_none() {
                self.store
                    .save_worker(&Worker::idle(id))
                    .map_err(String::from)?;
            }
        }

        let assignments = self.initial_assignments();
        let last = assignments.len();
        for (i, decision) in assignments.iter().enumerate() {
            log_info!("[W{}] {}: {}", decision.worker_id, decision.action, decision.reason);
            let result = self.execute(decision).await;
            if let Err(e) = self.events.record_decision(decision, &result) {
                log_warn!("[W{}] Failed to record decision: {}", decision.worker_id, e);
            }
            if let Err(e) = result {
                log_warn!("[W{}] Initial assignment failed: {}", decision.worker_id, e);
            }
            if i + 1 < last && self.settings.stagger_delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.settings.stagger_delay_secs)).await;
            }
        }

        Ok(())
    }

    /// Configured initial assignments for workers that are idle now and
    /// issues that are still pending.
    fn initial_assignments(&self) -> Vec<Decision> {
        let mut claims = ClaimSet::new();
        let mut out = Vec::new();
        for config in &self.configs {
            for (&worker_id, &number) in &config.initial_assignments {
                let worker = self.store.load_or_idle(worker_id);
                let pending = config
                    .get_issue(number)
                    .is_some_and(|i| i.status == crate::types::IssueStatus::Pending);
                if worker.status != WorkerStatus::Idle
                    || !pending
                    || out.iter().any(|d: &Decision| d.worker_id == worker_id)
                    || !claims.claim(config.id(), number)
                {
                    continue;
                }
                let action = if self.configs.first().map(|c| c.id()) == Some(config.id()) {
                    Action::Reassign
                } else {
                    Action::ReassignCross
                };
                out.push(
                    Decision::new(action, worker_id, None, "initial assignment")
                        .with_new_issue(number, config.id().to_path_buf()),
                );
            }
        }
        out
    }
}
