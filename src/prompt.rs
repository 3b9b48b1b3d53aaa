use std::path::Path;

use crate::agent::{strip_sentinels, ArbiterContext};
use crate::config::{ProjectConfig, RepoConfig};
use crate::types::{Issue, Stage};

/// Characters of retry analysis carried into the resumed stage.
pub const RETRY_CONTEXT_MAX_CHARS: usize = 8000;

/// Everything a worker prompt is built from.
pub struct PromptParams<'a> {
    pub config: &'a ProjectConfig,
    pub repo: &'a RepoConfig,
    pub issue: &'a Issue,
    pub worker_id: u32,
    pub worktree: &'a Path,
    pub branch: &'a str,
    /// Issue description from the tracker (or its fallback text).
    pub issue_body: &'a str,
}

/// Full prompt for one pipeline stage.
///
/// Structure: [Header] + [Stage workflow] + [Extra context] + [Footer]
pub fn stage_prompt(params: &PromptParams, stage: Stage, extra_context: Option<&str>) -> String {
    let mut sections = vec![header(params, stage), stage_workflow(params.config, stage)];
    if let Some(extra) = extra_context.filter(|e| !e.trim().is_empty()) {
        sections.push(extra.trim().to_string());
    }
    sections.push(footer(params));
    sections.join("\n\n")
}

fn header(params: &PromptParams, stage: Stage) -> String {
    let ctx = &params.config.project_context;

    let mut rules = vec![
        "Redirect verbose command output to log files (`> /tmp/<name>.log 2>&1`).".to_string(),
    ];
    rules.extend(ctx.safety_rules.iter().cloned());
    rules.push("Read CLAUDE.md first if the repository has one.".to_string());
    let rules: Vec<String> = rules
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}", i + 1, r))
        .collect();

    let mut out = format!(
        "You are an autonomous worker in the **{stage}** stage for the {project} project.\n\n\
         ## Your Assignment\n\n\
         **Issue #{number}** — {title}\n\
         **Branch**: {branch}\n\
         **Worktree**: {worktree}\n\
         **Worker ID**: {worker}\n\n\
         ## Issue Details\n\n{body}\n\n\
         ## Repository Context\n\n\
         This is a git worktree branched from {base}.",
        stage = stage,
        project = params.config.project,
        number = params.issue.number,
        title = params.issue.title,
        branch = params.branch,
        worktree = params.worktree.display(),
        worker = params.worker_id,
        body = params.issue_body.trim(),
        base = params.repo.default_branch,
    );
    if !ctx.language.is_empty() {
        out.push_str(&format!("\nLanguage: {}", ctx.language));
    }
    out.push_str(&format!("\n\n## Critical Rules\n\n{}", rules.join("\n")));
    if !ctx.key_files.is_empty() {
        let files: Vec<String> = ctx.key_files.iter().map(|f| format!("- `{}`", f)).collect();
        out.push_str(&format!(
            "\n\n## Key Files\n\nRead these early to learn project conventions:\n{}",
            files.join("\n")
        ));
    }
    out
}

fn command_or(command: &str, fallback: &str) -> String {
    if command.is_empty() {
        fallback.to_string()
    } else {
        format!("`{}`", command)
    }
}

fn stage_workflow(config: &ProjectConfig, stage: Stage) -> String {
    let ctx = &config.project_context;
    let build = command_or(&ctx.build_command, "the build command");
    let test = command_or(&ctx.test_command, "the test command");

    match stage {
        Stage::Implement => format!(
            "## Workflow — Implement\n\n\
             1. Understand the existing code before changing it\n\
             2. Implement what the issue describes\n\
             3. Build with {build} and fix failures\n\
             4. Write initial tests and run them with {test}\n\
             5. Commit and push your work"
        ),
        Stage::Optimize => format!(
            "## Workflow — Optimize\n\n\
             The feature is implemented on this branch. Review it for performance and clarity:\n\
             1. Remove duplication and dead code introduced by the change\n\
             2. Fix obvious inefficiencies without changing behaviour\n\
             3. Confirm {build} and {test} still pass\n\
             4. Commit and push"
        ),
        Stage::WriteTests => format!(
            "## Workflow — Write Tests\n\n\
             1. Read the change on this branch\n\
             2. Add tests for the main paths, edge cases and error handling\n\
             3. Run {test} and make the new tests pass\n\
             4. Commit and push"
        ),
        Stage::RunTestsFix => format!(
            "## Workflow — Run Tests & Fix\n\n\
             1. Run the full suite with {test}\n\
             2. Fix every failure caused by this branch\n\
             3. Repeat until green, then confirm {build}\n\
             4. Commit and push"
        ),
        Stage::Document => "## Workflow — Document\n\n\
             1. Update user-facing docs and doc comments for the change\n\
             2. Keep examples runnable\n\
             3. Commit and push"
            .to_string(),
        Stage::Research => "## Workflow — Research\n\n\
             1. Collect the sources and existing material the issue needs\n\
             2. Record findings and open questions in the repository's notes\n\
             3. Commit and push"
            .to_string(),
        Stage::Draft => "## Workflow — Draft\n\n\
             1. Write the first complete draft from the research notes\n\
             2. Follow the repository's style and structure\n\
             3. Commit and push"
            .to_string(),
        Stage::Validate => "## Workflow — Validate\n\n\
             1. Check every claim, command and link in the draft\n\
             2. Fix what is wrong; note what cannot be verified\n\
             3. Commit and push"
            .to_string(),
        Stage::Review => "## Workflow — Review\n\n\
             1. Read the whole branch diff as a reviewer would\n\
             2. Fix correctness, safety and consistency problems you find\n\
             3. Commit and push"
            .to_string(),
    }
}

fn footer(params: &PromptParams) -> String {
    let ctx = &params.config.project_context;
    let commit_example = if ctx.commit_prefix.is_empty() {
        format!("description of change (#{})", params.issue.number)
    } else {
        format!("{}: description of change (#{})", ctx.commit_prefix, params.issue.number)
    };

    format!(
        "## Commit Convention\n\n```\n{commit_example}\n```\n\n\
         ## Completion\n\n\
         When this stage is done, commit everything and push with \
         `git push origin {branch} > /tmp/push-{worker}.log 2>&1`.\n\
         End with a short summary of what was done.\n\n\
         Do NOT open pull requests.",
        commit_example = commit_example,
        branch = params.branch,
        worker = params.worker_id,
    )
}

/// First retry phase: diagnose why the last attempt failed.
pub fn failure_analysis_prompt(params: &PromptParams, failure_log: Option<&Path>) -> String {
    let log_line = match failure_log {
        Some(path) => format!(
            "**Failure log**: `{}` — read the last 200 lines for errors",
            path.display()
        ),
        None => "**Failure log**: not available; rely on the git state".to_string(),
    };

    format!(
        "You are diagnosing a failed attempt at issue #{number} ({title}) in the {project} project.\n\n\
         ## Sources\n\n\
         1. {log_line}\n\
         2. **Git state**: run `git log --oneline -10` and `git status` in `{worktree}`\n\
         3. **Branch**: `{branch}`\n\n\
         ## Issue\n\n{body}\n\n\
         ## Output\n\n\
         Write a diagnosis under 500 words with:\n\
         - **Root cause**\n\
         - **Progress made**\n\
         - **Key errors**\n\
         - **Blockers**\n\n\
         Do not change any files.",
        number = params.issue.number,
        title = params.issue.title,
        project = params.config.project,
        log_line = log_line,
        worktree = params.worktree.display(),
        branch = params.branch,
        body = params.issue_body.trim(),
    )
}

/// Second retry phase: propose ways past the diagnosed failure.
pub fn explore_prompt(params: &PromptParams) -> String {
    let ctx = &params.config.project_context;
    let mut facts = vec![
        format!("- **Worktree**: `{}`", params.worktree.display()),
        format!("- **Branch**: `{}`", params.branch),
    ];
    if !ctx.language.is_empty() {
        facts.push(format!("- **Language**: {}", ctx.language));
    }
    if !ctx.build_command.is_empty() {
        facts.push(format!("- **Build**: `{}`", ctx.build_command));
    }
    if !ctx.test_command.is_empty() {
        facts.push(format!("- **Test**: `{}`", ctx.test_command));
    }

    format!(
        "Based on the failure analysis above, propose concrete approaches to complete \
         issue #{number} ({title}).\n\n\
         ## Context\n\n{facts}\n\n\
         ## Output\n\n\
         A ranked list of 2-3 approaches. For each: files to modify, key changes, risks.\n\
         Recommend the one most likely to succeed. Do not change any files.",
        number = params.issue.number,
        title = params.issue.title,
        facts = facts.join("\n"),
    )
}

/// Wrap the analysis and exploration output for the resumed stage.
///
/// Sentinel lines are dropped and only the last `RETRY_CONTEXT_MAX_CHARS`
/// characters are kept. Returns an empty string when there is nothing useful.
pub fn extract_retry_context(log: &str) -> String {
    let content = strip_sentinels(log);
    let content = content.trim();
    if content.is_empty() {
        return String::new();
    }

    let count = content.chars().count();
    let content: String = if count > RETRY_CONTEXT_MAX_CHARS {
        content.chars().skip(count - RETRY_CONTEXT_MAX_CHARS).collect()
    } else {
        content.to_string()
    };

    format!(
        "## Previous Failure Analysis\n\n\
         This issue failed before. A diagnosis and a set of proposed approaches follow.\n\n\
         <failure-analysis>\n{}\n</failure-analysis>\n\n\
         Verify these conclusions against the code before acting on them; follow the recommended approach.",
        content
    )
}

/// Progress summary handed to a restarted worker.
pub fn continuation_context(
    recent_log: &str,
    diff_stat: &str,
    status: &str,
    log_tail: &str,
) -> String {
    let or = |s: &str, fallback: &str| {
        if s.trim().is_empty() {
            fallback.to_string()
        } else {
            s.trim().to_string()
        }
    };
    let failure = strip_sentinels(log_tail);

    format!(
        "## Continuing Previous Work\n\n\
         A previous session on this branch stopped before finishing. Pick up where it left off.\n\n\
         ### Commits so far\n```\n{}\n```\n\n\
         ### Files changed\n```\n{}\n```\n\n\
         ### Uncommitted changes\n```\n{}\n```\n\n\
         ### Last output before stopping\n```\n{}\n```",
        or(recent_log, "(no commits yet)"),
        or(diff_stat, "(no changes from base)"),
        or(status, "(clean working tree)"),
        or(&failure, "(no output)"),
    )
}

/// Question put to the arbiter for a clean exit whose log mentions errors.
pub fn arbiter_prompt(context: &ArbiterContext) -> String {
    format!(
        "A worker on issue #{issue} exited with status 0 and made these commits:\n\n\
         ```\n{commits}\n```\n\n\
         but the end of its log mentions errors:\n\n\
         ```\n{log}\n```\n\n\
         Answer with a single letter.\n\
         A: the work is complete; the errors were handled or are unrelated.\n\
         B: the errors are real and the worker should continue fixing them.",
        issue = context.issue_number,
        commits = context.commits.trim(),
        log = context.log_excerpt.trim(),
    )
}
