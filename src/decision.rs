//! Worker-lifecycle decision engine.
//!
//! `compute_decisions` turns one `WorkerSnapshot` into the list of actions the
//! monitor should execute for that worker. It performs no I/O: everything it
//! needs is in the snapshot, the loaded configurations, the worker record and
//! the cycle's claim set.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::agent::{last_sentinel, strip_sentinels, Sentinel};
use crate::config::ProjectConfig;
use crate::scheduler::{
    next_available_issue_global, next_retriable_issue_global, owning_config, ClaimSet,
};
use crate::types::{
    Action, Decision, Issue, IssueStatus, LogClass, Verdict, Worker, WorkerSnapshot, WorkerStatus,
};

/// A running worker with an empty log this long has hit an API-layer failure.
pub const EMPTY_LOG_GRACE_SECS: u64 = 120;

/// Restarts allowed for the empty-log path, independent of `max_retries`.
pub const EMPTY_LOG_RETRY_CAP: u32 = 3;

/// Non-zero exits with no output defer once the retry count reaches this.
pub const INFRA_DEFER_THRESHOLD: u32 = 3;

/// A log modified within this window counts as active after the wall-clock ceiling.
pub const ACTIVE_LOG_WINDOW_SECS: u64 = 120;

/// Shorter tails (after trimming) carry no usable output.
pub const MEANINGFUL_OUTPUT_MIN_CHARS: usize = 200;

/// Tail fragments that mean the agent runtime itself crashed.
pub const CRASH_SIGNATURES: [&str; 6] = [
    "No messages returned",
    "promise rejected",
    "processTicksAndRejections",
    "ENOMEM",
    "killed",
    "Segmentation fault",
];

/// Tail fragments that make a clean exit ambiguous.
pub const ERROR_MARKERS: [&str; 7] = [
    "FAIL",
    "panic:",
    "fatal:",
    "Error:",
    "error:",
    "compilation failed",
    "build failed",
];

/// Classify a log tail. Sentinel lines are ignored.
pub fn classify_log(tail: &str) -> LogClass {
    let text = strip_sentinels(tail);
    let trimmed = text.trim();

    if trimmed.is_empty() {
        return LogClass::NoOutput;
    }
    if CRASH_SIGNATURES.iter().any(|sig| trimmed.contains(sig)) {
        return LogClass::InfraError;
    }
    if trimmed.chars().count() < MEANINGFUL_OUTPUT_MIN_CHARS {
        return LogClass::NoOutput;
    }
    LogClass::MeaningfulOutput
}

pub fn log_has_error_markers(tail: &str) -> bool {
    let text = strip_sentinels(tail);
    ERROR_MARKERS.iter().any(|m| text.contains(m))
}

/// True when the monitor should ask the arbiter before deciding.
pub fn needs_arbitration(snapshot: &WorkerSnapshot) -> bool {
    snapshot.exit_code == Some(0)
        && snapshot.has_commits()
        && log_has_error_markers(&snapshot.log_tail)
}

/// Inputs besides the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    /// Every loaded configuration; the first is the home configuration.
    pub configs: &'a [ProjectConfig],
    /// Durable record of the worker, if one exists.
    pub worker: Option<&'a Worker>,
    pub claims: &'a ClaimSet,
    pub now: DateTime<Utc>,
    pub max_retry_rounds: u32,
}

impl<'a> DecisionContext<'a> {
    fn home(&self) -> Option<&'a Path> {
        self.configs.first().map(|c| c.id())
    }
}

/// Decide what to do with one worker.
///
/// At most one action in the result settles the current issue
/// (`mark_complete`, `skip` or `defer`); at most one hands out a new issue.
pub fn compute_decisions(snapshot: &WorkerSnapshot, ctx: &DecisionContext) -> Vec<Decision> {
    let w = snapshot.worker_id;

    let issue_number = match snapshot.issue_number {
        Some(n) if snapshot.status != WorkerStatus::Idle => n,
        _ => return assign_idle(snapshot, ctx, None, None),
    };

    let source = ctx.worker.and_then(|r| r.source_config.as_deref());
    let Some(config) = owning_config(ctx.configs, source, issue_number) else {
        return vec![Decision::new(
            Action::Idle,
            w,
            Some(issue_number),
            "assigned issue is not in any loaded configuration",
        )];
    };
    let Some(issue) = config.get_issue(issue_number) else {
        return vec![Decision::new(
            Action::Idle,
            w,
            Some(issue_number),
            "assigned issue is missing from its configuration",
        )
        .with_source(config.id().to_path_buf())];
    };

    // The issue was settled but the worker record was not released.
    if matches!(issue.status, IssueStatus::Completed | IssueStatus::Failed)
        && !snapshot.process_alive
    {
        let mut out = vec![Decision::new(
            Action::Idle,
            w,
            Some(issue_number),
            &format!("issue #{} is already {}", issue_number, issue.status),
        )
        .with_source(config.id().to_path_buf())];
        out.extend(assign_idle(snapshot, ctx, Some(issue_number), None));
        return out;
    }

    let worker = WorkerView {
        snapshot,
        ctx,
        config,
        issue,
    };

    match snapshot.exit_code {
        Some(0) => worker.on_clean_exit(),
        Some(code) => worker.on_failed_exit(code),
        None if snapshot.process_alive => worker.on_running(),
        None if snapshot.status == WorkerStatus::Running => worker.on_silent_death(),
        None => vec![worker.decision(Action::Noop, "worker is not running")],
    }
}

/// Reassignment search for a worker with free capacity.
fn assign_idle(
    snapshot: &WorkerSnapshot,
    ctx: &DecisionContext,
    current: Option<u32>,
    just_completed: Option<(&Path, u32)>,
) -> Vec<Decision> {
    let w = snapshot.worker_id;

    if let Some(c) = next_available_issue_global(ctx.configs, ctx.claims, just_completed) {
        let action = if ctx.home() == Some(c.config.id()) {
            Action::Reassign
        } else {
            Action::ReassignCross
        };
        let reason = format!(
            "next eligible issue #{} in {} (wave {}, priority {})",
            c.issue.number, c.config.project, c.issue.wave, c.issue.priority
        );
        return vec![Decision::new(action, w, current, &reason)
            .with_new_issue(c.issue.number, c.config.id().to_path_buf())];
    }

    if let Some(c) = next_retriable_issue_global(ctx.configs, ctx.claims, ctx.max_retry_rounds) {
        let reason = format!(
            "no eligible issues; retrying failed issue #{} in {}",
            c.issue.number, c.config.project
        );
        return vec![Decision::new(Action::RetryFailed, w, current, &reason)
            .with_new_issue(c.issue.number, c.config.id().to_path_buf())];
    }

    if current.is_some() || snapshot.status != WorkerStatus::Idle {
        return vec![Decision::new(Action::Idle, w, current, "no eligible work")];
    }

    vec![Decision::new(Action::Noop, w, None, "idle; no eligible work")]
}

/// One worker with its resolved configuration and issue.
struct WorkerView<'a> {
    snapshot: &'a WorkerSnapshot,
    ctx: &'a DecisionContext<'a>,
    config: &'a ProjectConfig,
    issue: &'a Issue,
}

impl WorkerView<'_> {
    fn decision(&self, action: Action, reason: &str) -> Decision {
        Decision::new(
            action,
            self.snapshot.worker_id,
            Some(self.issue.number),
            reason,
        )
        .with_source(self.config.id().to_path_buf())
    }

    fn stage_name(&self, index: usize) -> String {
        self.config
            .stage_at(index)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("stage {}", index))
    }

    fn budget_left(&self) -> bool {
        self.snapshot.retry_count < self.config.tunables.max_retries
    }

    fn log_age(&self) -> Option<u64> {
        self.snapshot
            .log_mtime
            .map(|m| (self.ctx.now - m).num_seconds().max(0) as u64)
    }

    /// Stage finished with accepted work: advance, or complete and look for more.
    fn succeed(&self, reason: &str) -> Vec<Decision> {
        let index = self.issue.pipeline_stage;
        if self.config.has_next_stage(index) {
            return vec![self.decision(
                Action::AdvanceStage,
                &format!(
                    "{}; {} done, advancing to {}",
                    reason,
                    self.stage_name(index),
                    self.stage_name(index + 1)
                ),
            )];
        }

        let mut out = vec![self.decision(
            Action::MarkComplete,
            &format!("{}; final stage {} done", reason, self.stage_name(index)),
        )];
        out.extend(assign_idle(
            self.snapshot,
            self.ctx,
            Some(self.issue.number),
            Some((self.config.id(), self.issue.number)),
        ));
        out
    }

    fn push_then_succeed(&self, reason: &str) -> Vec<Decision> {
        let mut out = Vec::new();
        if self.snapshot.has_commits() {
            let count = self.snapshot.commit_lines().len();
            out.push(self.decision(
                Action::Push,
                &format!("{} new commit(s) to publish", count),
            ));
        }
        out.extend(self.succeed(reason));
        out
    }

    fn advance_or_skip(&self, reason: &str) -> Decision {
        let index = self.issue.pipeline_stage;
        if self.config.has_next_stage(index) {
            self.decision(
                Action::AdvanceStage,
                &format!(
                    "{}; retries exhausted on {}, advancing to {}",
                    reason,
                    self.stage_name(index),
                    self.stage_name(index + 1)
                ),
            )
        } else {
            self.decision(
                Action::Skip,
                &format!(
                    "{}; retries exhausted on final stage {}",
                    reason,
                    self.stage_name(index)
                ),
            )
        }
    }

    fn restart_or_escalate(&self, reason: &str, continuation: bool) -> Vec<Decision> {
        if self.budget_left() {
            vec![self
                .decision(
                    Action::Restart,
                    &format!(
                        "{} (retry {}/{})",
                        reason,
                        self.snapshot.retry_count + 1,
                        self.config.tunables.max_retries
                    ),
                )
                .with_continuation(continuation)]
        } else {
            vec![self.advance_or_skip(reason)]
        }
    }

    fn on_clean_exit(&self) -> Vec<Decision> {
        if needs_arbitration(self.snapshot) && self.snapshot.verdict == Some(Verdict::Retry) {
            return vec![self
                .decision(
                    Action::Restart,
                    "exit 0 with commits but errors in log; arbiter asked for a retry",
                )
                .with_continuation(true)];
        }
        self.push_then_succeed("exit 0")
    }

    fn on_failed_exit(&self, code: i32) -> Vec<Decision> {
        let class = classify_log(&self.snapshot.log_tail);
        let progress = self.snapshot.has_commits();
        let retries = self.snapshot.retry_count;

        if class != LogClass::MeaningfulOutput && !progress && retries >= INFRA_DEFER_THRESHOLD {
            return vec![self.decision(
                Action::Defer,
                &format!(
                    "exit {} with no output or progress after {} retries; treating as infrastructure failure",
                    code, retries
                ),
            )];
        }

        if progress || self.budget_left() {
            let what = if progress { "with commits" } else { "without commits" };
            return vec![self
                .decision(
                    Action::Restart,
                    &format!(
                        "exit {} {} (retry {}/{})",
                        code,
                        what,
                        retries + 1,
                        self.config.tunables.max_retries
                    ),
                )
                .with_continuation(class == LogClass::MeaningfulOutput)];
        }

        vec![self.advance_or_skip(&format!("exit {}", code))]
    }

    fn on_running(&self) -> Vec<Decision> {
        let snapshot = self.snapshot;
        let tunables = &self.config.tunables;

        if matches!(last_sentinel(&snapshot.log_tail), Some(Sentinel::Exit(_))) {
            return vec![self.decision(Action::Noop, "exit sentinel written; awaiting signal")];
        }

        let log_age = self.log_age();

        if let Some(elapsed) = snapshot.elapsed_seconds {
            if elapsed > tunables.wall_clock_timeout {
                let over = format!(
                    "wall-clock limit hit ({}s > {}s)",
                    elapsed, tunables.wall_clock_timeout
                );
                if snapshot.has_commits() {
                    return self.push_then_succeed(&over);
                }
                let active = log_age.is_some_and(|age| age <= ACTIVE_LOG_WINDOW_SECS);
                if !active {
                    return self.restart_or_escalate(&format!("{}, log stale", over), true);
                }
                return vec![self.decision(Action::Noop, &format!("{}, log still active", over))];
            }
        }

        // The START sentinel alone does not count as output.
        let empty = snapshot.log_size == 0 || strip_sentinels(&snapshot.log_tail).trim().is_empty();
        if empty {
            let age = log_age.or(snapshot.elapsed_seconds).unwrap_or(0);
            if age > EMPTY_LOG_GRACE_SECS {
                let reason = format!("log empty for {}s", age);
                if snapshot.retry_count < EMPTY_LOG_RETRY_CAP {
                    return vec![self
                        .decision(
                            Action::Restart,
                            &format!(
                                "{} (empty-log retry {}/{})",
                                reason,
                                snapshot.retry_count + 1,
                                EMPTY_LOG_RETRY_CAP
                            ),
                        )
                        .with_continuation(false)];
                }
                return vec![self.advance_or_skip(&reason)];
            }
            return vec![self.decision(Action::Noop, "waiting for first output")];
        }

        if let Some(age) = log_age {
            if age > tunables.stall_timeout {
                return self.restart_or_escalate(
                    &format!("stalled: log unchanged for {}s", age),
                    true,
                );
            }
        }

        vec![self.decision(Action::Noop, "running")]
    }

    fn on_silent_death(&self) -> Vec<Decision> {
        if self.snapshot.has_commits() {
            return self.push_then_succeed("process exited without a signal after committing");
        }
        if self.budget_left() {
            return vec![self
                .decision(
                    Action::Restart,
                    &format!(
                        "process died without a signal (retry {}/{})",
                        self.snapshot.retry_count + 1,
                        self.config.tunables.max_retries
                    ),
                )
                .with_continuation(true)];
        }
        vec![self.decision(
            Action::Skip,
            "process died without a signal; retries exhausted",
        )]
    }
}
