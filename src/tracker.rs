use std::time::Duration;

use crate::agent::run_captured;
use crate::config::{Platform, RepoConfig};
use crate::store::StateStore;
use crate::types::Issue;
use crate::{log_debug, log_warn};

const GH_BODY_JQ: &str = ".title + \"\\n\\n\" + .body";

/// Issue-tracking platform: fetch an issue description by number.
pub trait IssueTracker: Send + Sync {
    fn fetch_body(
        &self,
        repo: &RepoConfig,
        number: u32,
    ) -> impl std::future::Future<Output = Result<String, String>> + Send;
}

/// `gh` / `glab` CLI implementation, run inside the repository checkout.
pub struct CliTracker {
    pub timeout: Duration,
}

impl CliTracker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl IssueTracker for CliTracker {
    async fn fetch_body(&self, repo: &RepoConfig, number: u32) -> Result<String, String> {
        let number = number.to_string();
        let (program, args): (&str, Vec<&str>) = match repo.platform {
            Platform::Github => (
                "gh",
                vec!["issue", "view", &number, "--json", "title,body", "--jq", GH_BODY_JQ],
            ),
            Platform::Gitlab => ("glab", vec!["issue", "view", &number]),
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&args).current_dir(&repo.path);
        let body = run_captured(cmd, &format!("{} issue view", program), self.timeout).await?;
        if body.trim().is_empty() {
            return Err(format!("{} returned an empty issue body", program));
        }
        Ok(body)
    }
}

/// Issue description for prompts: cache, then tracker, then a placeholder.
///
/// Never fails; a tracker error degrades to text built from the title.
pub async fn issue_body<K: IssueTracker>(
    tracker: &K,
    store: &StateStore,
    repo: &RepoConfig,
    issue: &Issue,
) -> String {
    if let Some(body) = store.cached_issue_body(issue.number) {
        log_debug!("[tracker] Using cached body for #{}", issue.number);
        return body;
    }

    match tracker.fetch_body(repo, issue.number).await {
        Ok(body) => {
            if let Err(e) = store.cache_issue_body(issue.number, &body) {
                log_warn!("[tracker] Failed to cache #{}: {}", issue.number, e);
            }
            body
        }
        Err(e) => {
            log_warn!("[tracker] Could not fetch #{}: {}", issue.number, e);
            format!(
                "(Issue description unavailable: {}.)\n\nWork from the title: {}",
                e, issue.title
            )
        }
    }
}
