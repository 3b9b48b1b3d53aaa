use crate::config::ProjectConfig;
use crate::types::{Issue, Worker, WorkerSnapshot, WorkerStage, WorkerStatus};

/// Next move for a worker inside the diagnose/explore retry workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// The current phase is still running.
    Wait,
    /// Analysis is over; launch the explore phase on the same log.
    Explore { timed_out: bool },
    /// Exploration is over; resume the issue's pipeline stage with the findings.
    Resume { timed_out: bool },
}

impl RetryStep {
    pub fn timed_out(&self) -> bool {
        matches!(
            self,
            RetryStep::Explore { timed_out: true } | RetryStep::Resume { timed_out: true }
        )
    }
}

impl std::fmt::Display for RetryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStep::Wait => write!(f, "wait"),
            RetryStep::Explore { .. } => write!(f, "retry_explore"),
            RetryStep::Resume { .. } => write!(f, "resume"),
        }
    }
}

/// Retry-workflow transition for `worker`, or `None` when it is not in a retry phase.
///
/// A phase ends when its signal appears, when its process is gone, or when it
/// has run longer than `phase_timeout_secs`. Workers inside the workflow skip
/// the ordinary decision engine for the cycle.
pub fn retry_step(
    snapshot: &WorkerSnapshot,
    worker: &Worker,
    phase_timeout_secs: u64,
) -> Option<RetryStep> {
    let stage = worker.stage?;
    if !stage.is_retry_phase() || worker.issue_number.is_none() {
        return None;
    }

    let finished = snapshot.is_finished()
        || (!snapshot.process_alive && worker.status == WorkerStatus::Running);
    let timed_out = !finished
        && snapshot
            .elapsed_seconds
            .is_some_and(|elapsed| elapsed > phase_timeout_secs);

    if !finished && !timed_out {
        return Some(RetryStep::Wait);
    }

    match stage {
        WorkerStage::RetryAnalyze => Some(RetryStep::Explore { timed_out }),
        WorkerStage::RetryExplore => Some(RetryStep::Resume { timed_out }),
        WorkerStage::Pipeline(_) => None,
    }
}

/// Stage the issue currently sits in, as a worker stage.
pub fn current_stage(config: &ProjectConfig, issue: &Issue) -> Option<WorkerStage> {
    config
        .stage_at(issue.pipeline_stage)
        .map(WorkerStage::Pipeline)
}

/// Stage after the issue's current one, with its index.
pub fn next_stage(config: &ProjectConfig, issue: &Issue) -> Option<(usize, WorkerStage)> {
    let next = issue.pipeline_stage + 1;
    config
        .stage_at(next)
        .map(|stage| (next, WorkerStage::Pipeline(stage)))
}

/// Human label such as `write_tests (2/3)`.
pub fn stage_label(config: &ProjectConfig, issue: &Issue) -> String {
    match config.stage_at(issue.pipeline_stage) {
        Some(stage) => format!(
            "{} ({}/{})",
            stage,
            issue.pipeline_stage + 1,
            config.pipeline.len()
        ),
        None => format!("stage {}", issue.pipeline_stage),
    }
}
