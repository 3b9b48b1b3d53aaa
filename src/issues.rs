use std::collections::HashSet;

use crate::types::{Issue, IssueStatus};

/// Issue totals by status, derived from the configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IssueCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl IssueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }

    /// Issues that still need a worker: pending or in progress.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_progress
    }

    pub fn add(&mut self, other: IssueCounts) {
        self.pending += other.pending;
        self.in_progress += other.in_progress;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

impl std::fmt::Display for IssueCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed, {} in progress, {} pending, {} failed",
            self.completed,
            self.total(),
            self.in_progress,
            self.pending,
            self.failed
        )
    }
}

pub fn count_issues(issues: &[Issue]) -> IssueCounts {
    let mut counts = IssueCounts::default();
    for issue in issues {
        match issue.status {
            IssueStatus::Pending => counts.pending += 1,
            IssueStatus::InProgress => counts.in_progress += 1,
            IssueStatus::Completed => counts.completed += 1,
            IssueStatus::Failed => counts.failed += 1,
        }
    }
    counts
}

pub fn numbers_with_status(issues: &[Issue], status: IssueStatus) -> HashSet<u32> {
    issues
        .iter()
        .filter(|i| i.status == status)
        .map(|i| i.number)
        .collect()
}

/// True when every dependency of `issue` is in `completed`.
pub fn dependencies_met(issue: &Issue, completed: &HashSet<u32>) -> bool {
    issue.depends_on.iter().all(|dep| completed.contains(dep))
}

/// Next issue to hand out, by (wave, priority) ascending.
///
/// An issue qualifies when it is pending, not in `in_progress`, and every
/// dependency is in `completed`. Ties keep document order.
pub fn next_available_issue<'a>(
    issues: &'a [Issue],
    completed: &HashSet<u32>,
    in_progress: &HashSet<u32>,
) -> Option<&'a Issue> {
    let mut sorted: Vec<&Issue> = issues.iter().collect();
    sorted.sort_by_key(|i| i.sort_key());

    sorted.into_iter().find(|issue| {
        issue.status == IssueStatus::Pending
            && !in_progress.contains(&issue.number)
            && dependencies_met(issue, completed)
    })
}

/// Number of issues that list `number` directly in their `depends_on`.
pub fn dependents_count(issues: &[Issue], number: u32) -> usize {
    issues
        .iter()
        .filter(|i| i.depends_on.contains(&number))
        .count()
}

/// Pending issues whose dependencies are not all completed, with the missing ones.
pub fn blocked_issues(issues: &[Issue]) -> Vec<(u32, Vec<u32>)> {
    let completed = numbers_with_status(issues, IssueStatus::Completed);
    issues
        .iter()
        .filter(|i| i.status == IssueStatus::Pending)
        .filter_map(|i| {
            let missing: Vec<u32> = i
                .depends_on
                .iter()
                .copied()
                .filter(|d| !completed.contains(d))
                .collect();
            (!missing.is_empty()).then_some((i.number, missing))
        })
        .collect()
}
