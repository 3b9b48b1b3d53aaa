use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::ProjectConfig;
use crate::issues::{dependents_count, next_available_issue, numbers_with_status};
use crate::types::{Decision, Issue, IssueStatus};

/// Issues reserved during the current cycle, keyed by owning configuration.
///
/// Lives for one cycle only; persisted issue status takes over afterwards.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    claims: HashSet<(PathBuf, u32)>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an issue. Returns false if it was already claimed.
    pub fn claim(&mut self, config: &Path, issue: u32) -> bool {
        self.claims.insert((config.to_path_buf(), issue))
    }

    pub fn is_claimed(&self, config: &Path, issue: u32) -> bool {
        self.claims.contains(&(config.to_path_buf(), issue))
    }

    pub fn claimed_in(&self, config: &Path) -> HashSet<u32> {
        self.claims
            .iter()
            .filter(|(c, _)| c == config)
            .map(|(_, n)| *n)
            .collect()
    }

    /// Claim every issue handed out by `decisions`.
    pub fn record(&mut self, decisions: &[Decision]) {
        for d in decisions.iter().filter(|d| d.action.assigns_issue()) {
            if let (Some(issue), Some(config)) = (d.new_issue, d.source_config.as_deref()) {
                self.claim(config, issue);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// An issue together with the configuration that owns it.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub config: &'a ProjectConfig,
    pub issue: &'a Issue,
}

/// Best eligible issue across every configuration.
///
/// Each configuration contributes only its own best candidate; those locals
/// are then compared by (wave, priority) and the first configuration wins
/// ties. A configuration's second-best issue is never considered even if it
/// beats another configuration's best.
///
/// `assume_completed` treats one issue as completed, so a worker that just
/// finished it can be handed a dependent in the same cycle.
pub fn next_available_issue_global<'a>(
    configs: &'a [ProjectConfig],
    claims: &ClaimSet,
    assume_completed: Option<(&Path, u32)>,
) -> Option<Candidate<'a>> {
    let mut best: Option<Candidate<'a>> = None;

    for config in configs {
        let mut completed = numbers_with_status(&config.issues, IssueStatus::Completed);
        let mut in_progress = numbers_with_status(&config.issues, IssueStatus::InProgress);
        in_progress.extend(claims.claimed_in(config.id()));
        if let Some((path, number)) = assume_completed {
            if path == config.id() {
                completed.insert(number);
                in_progress.insert(number);
            }
        }

        let Some(issue) = next_available_issue(&config.issues, &completed, &in_progress) else {
            continue;
        };

        let better = match &best {
            Some(current) => issue.sort_key() < current.issue.sort_key(),
            None => true,
        };
        if better {
            best = Some(Candidate { config, issue });
        }
    }

    best
}

/// Failed issue most worth retrying across every configuration.
///
/// Scores by direct dependents (more unblocked work wins), then by
/// (wave, priority). Issues that already used `max_rounds` diagnose/retry
/// rounds are not retriable.
pub fn next_retriable_issue_global<'a>(
    configs: &'a [ProjectConfig],
    claims: &ClaimSet,
    max_rounds: u32,
) -> Option<Candidate<'a>> {
    let mut best: Option<(usize, Candidate<'a>)> = None;

    for config in configs {
        for issue in &config.issues {
            if issue.status != IssueStatus::Failed
                || issue.retry_rounds >= max_rounds
                || claims.is_claimed(config.id(), issue.number)
            {
                continue;
            }

            let score = dependents_count(&config.issues, issue.number);
            let better = match &best {
                Some((best_score, current)) => {
                    score > *best_score
                        || (score == *best_score && issue.sort_key() < current.issue.sort_key())
                }
                None => true,
            };
            if better {
                best = Some((score, Candidate { config, issue }));
            }
        }
    }

    best.map(|(_, c)| c)
}

/// Configuration owning `issue`, preferring the recorded `source_config`.
pub fn owning_config<'a>(
    configs: &'a [ProjectConfig],
    source_config: Option<&Path>,
    issue: u32,
) -> Option<&'a ProjectConfig> {
    if let Some(src) = source_config {
        if let Some(config) = configs.iter().find(|c| c.id() == src) {
            return Some(config);
        }
    }
    configs.iter().find(|c| c.get_issue(issue).is_some())
}
