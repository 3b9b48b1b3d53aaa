use std::collections::{HashMap, HashSet};

use crate::config::{ProjectConfig, Settings};
use crate::types::Issue;

/// A single preflight validation error with actionable context.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    /// What condition failed.
    pub condition: String,
    /// Where in the config the error originates.
    pub config_location: String,
    /// How to fix it.
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Preflight error: {}\n  Config: {}\n  Fix: {}",
            self.condition, self.config_location, self.suggested_fix
        )
    }
}

/// Render a list of preflight errors for the terminal.
pub fn render(errors: &[PreflightError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run all preflight validation checks over every loaded configuration.
///
/// Phases:
/// 1. Fleet validation — project names are unique
/// 2. Structural validation — repos, pipeline, tunables
/// 3. Issue validation — duplicates, repo references, stage indices
/// 4. Dependency graph validation — dangling references, self-dependencies, cycles
/// 5. Initial assignments — worker range, issue existence, no double assignment
///
/// Returns `Ok(())` if all checks pass, or `Err(Vec<PreflightError>)` with all errors.
pub fn run_preflight(
    configs: &[ProjectConfig],
    settings: &Settings,
) -> Result<(), Vec<PreflightError>> {
    let mut errors = validate_projects(configs);

    for config in configs {
        errors.extend(validate_structure(config));
        errors.extend(validate_issues(config));
        errors.extend(validate_dependency_graph(config));
        errors.extend(validate_initial_assignments(config, settings.num_workers));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn location(config: &ProjectConfig) -> String {
    config
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.project.clone())
}

// --- Phase 1: Fleet validation ---

fn validate_projects(configs: &[ProjectConfig]) -> Vec<PreflightError> {
    let mut seen = HashSet::new();
    configs
        .iter()
        .filter(|c| !seen.insert(c.project.as_str()))
        .map(|c| PreflightError {
            condition: format!("Duplicate project name \"{}\"", c.project),
            config_location: format!("{} → project", location(c)),
            suggested_fix: "Give every project configuration a unique name".to_string(),
        })
        .collect()
}

// --- Phase 2: Structural validation ---

fn validate_structure(config: &ProjectConfig) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    let loc = location(config);

    if config.project.trim().is_empty() {
        errors.push(PreflightError {
            condition: "Project name is empty".to_string(),
            config_location: format!("{} → project", loc),
            suggested_fix: "Set \"project\" to a short identifier".to_string(),
        });
    }

    if config.repos.is_empty() {
        errors.push(PreflightError {
            condition: "No repositories configured".to_string(),
            config_location: format!("{} → repos", loc),
            suggested_fix: "Add at least one entry under \"repos\"".to_string(),
        });
    }

    for (name, repo) in &config.repos {
        if !repo.path.is_dir() {
            errors.push(PreflightError {
                condition: format!(
                    "Repository \"{}\" path {} is not a directory",
                    name,
                    repo.path.display()
                ),
                config_location: format!("{} → repos → {} → path", loc, name),
                suggested_fix: "Point the path at an existing checkout".to_string(),
            });
        }
        if repo.branch_prefix.trim().is_empty() {
            errors.push(PreflightError {
                condition: format!("Repository \"{}\" has an empty branch_prefix", name),
                config_location: format!("{} → repos → {} → branch_prefix", loc, name),
                suggested_fix: "Set branch_prefix, e.g. \"issue-\"".to_string(),
            });
        }
    }

    if config.issues.is_empty() {
        errors.push(PreflightError {
            condition: "No issues configured".to_string(),
            config_location: format!("{} → issues", loc),
            suggested_fix: "Add at least one issue".to_string(),
        });
    }

    if config.pipeline.is_empty() {
        errors.push(PreflightError {
            condition: "Pipeline has no stages".to_string(),
            config_location: format!("{} → pipeline", loc),
            suggested_fix: "List at least one stage, e.g. [\"implement\"]".to_string(),
        });
    }

    let t = &config.tunables;
    for (field, value) in [
        ("max_retries", u64::from(t.max_retries)),
        ("stall_timeout", t.stall_timeout),
        ("wall_clock_timeout", t.wall_clock_timeout),
        ("cycle_interval", t.cycle_interval),
    ] {
        if value < 1 {
            errors.push(PreflightError {
                condition: format!("{} must be >= 1", field),
                config_location: format!("{} → {}", loc, field),
                suggested_fix: format!("Set {} to at least 1", field),
            });
        }
    }

    errors
}

// --- Phase 3: Issue validation ---

fn validate_issues(config: &ProjectConfig) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    let loc = location(config);

    let mut indices: HashMap<u32, Vec<usize>> = HashMap::new();
    for (index, issue) in config.issues.iter().enumerate() {
        indices.entry(issue.number).or_default().push(index);
    }
    let mut duplicates: Vec<_> = indices
        .into_iter()
        .filter(|(_, idx)| idx.len() > 1)
        .collect();
    duplicates.sort_by_key(|(_, idx)| idx[0]);
    for (number, idx) in duplicates {
        errors.push(PreflightError {
            condition: format!("Duplicate issue #{} found at indices {:?}", number, idx),
            config_location: format!("{} → issues", loc),
            suggested_fix: "Remove or renumber the duplicate issue".to_string(),
        });
    }

    for issue in &config.issues {
        if let Some(repo) = &issue.repo {
            if !config.repos.contains_key(repo) {
                errors.push(PreflightError {
                    condition: format!(
                        "Issue #{} references unknown repository \"{}\"",
                        issue.number, repo
                    ),
                    config_location: format!("{} → issues → #{} → repo", loc, issue.number),
                    suggested_fix: "Use a name defined under \"repos\"".to_string(),
                });
            }
        }
        if !config.pipeline.is_empty() && issue.pipeline_stage >= config.pipeline.len() {
            errors.push(PreflightError {
                condition: format!(
                    "Issue #{} has pipeline_stage {} but the pipeline has {} stage(s)",
                    issue.number,
                    issue.pipeline_stage,
                    config.pipeline.len()
                ),
                config_location: format!(
                    "{} → issues → #{} → pipeline_stage",
                    loc, issue.number
                ),
                suggested_fix: "Reset pipeline_stage to a valid index".to_string(),
            });
        }
    }

    errors
}

// --- Phase 4: Dependency graph validation ---

/// Validate that the dependency graph has no dangling references, self-loops or cycles.
pub fn validate_dependency_graph(config: &ProjectConfig) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    let loc = location(config);

    let all_numbers: HashSet<u32> = config.issues.iter().map(|i| i.number).collect();

    for issue in &config.issues {
        for &dep in &issue.depends_on {
            if dep == issue.number {
                errors.push(PreflightError {
                    condition: format!("Issue #{} depends on itself", issue.number),
                    config_location: format!("{} → issues → #{} → depends_on", loc, issue.number),
                    suggested_fix: format!("Remove {} from its own depends_on", dep),
                });
            } else if !all_numbers.contains(&dep) {
                errors.push(PreflightError {
                    condition: format!(
                        "Issue #{} depends on #{} which does not exist",
                        issue.number, dep
                    ),
                    config_location: format!("{} → issues → #{} → depends_on", loc, issue.number),
                    suggested_fix: format!(
                        "Remove #{} from #{}'s depends_on, or add the missing issue",
                        dep, issue.number
                    ),
                });
            }
        }
    }

    for cycle in detect_cycles(&config.issues) {
        let path = cycle
            .iter()
            .map(|n| format!("#{}", n))
            .collect::<Vec<_>>()
            .join(" → ");
        errors.push(PreflightError {
            condition: format!("Circular dependency detected: {}", path),
            config_location: format!("{} → issues → depends_on", loc),
            suggested_fix: "Remove one dependency in the cycle to break it".to_string(),
        });
    }

    errors
}

/// DFS three-color cycle detection over the dependency relation.
///
/// Self-dependencies are reported separately and skipped here. Returns each
/// cycle as a path like `[1, 2, 3, 1]`.
pub fn detect_cycles(issues: &[Issue]) -> Vec<Vec<u32>> {
    #[derive(Clone, Copy, PartialEq)]
    enum VisitState {
        Unvisited,
        InStack,
        Done,
    }

    let by_number: HashMap<u32, &Issue> = issues.iter().map(|i| (i.number, i)).collect();
    let mut state: HashMap<u32, VisitState> = issues
        .iter()
        .map(|i| (i.number, VisitState::Unvisited))
        .collect();
    let mut cycles = Vec::new();

    fn dfs(
        number: u32,
        by_number: &HashMap<u32, &Issue>,
        state: &mut HashMap<u32, VisitState>,
        path: &mut Vec<u32>,
        cycles: &mut Vec<Vec<u32>>,
    ) {
        state.insert(number, VisitState::InStack);
        path.push(number);

        if let Some(issue) = by_number.get(&number) {
            for &dep in &issue.depends_on {
                if dep == number || !by_number.contains_key(&dep) {
                    continue;
                }
                match state.get(&dep) {
                    Some(VisitState::InStack) => {
                        if let Some(start) = path.iter().position(|&n| n == dep) {
                            let mut cycle = path[start..].to_vec();
                            cycle.push(dep);
                            cycles.push(cycle);
                        }
                    }
                    Some(VisitState::Unvisited) => dfs(dep, by_number, state, path, cycles),
                    _ => {}
                }
            }
        }

        path.pop();
        state.insert(number, VisitState::Done);
    }

    for issue in issues {
        if state.get(&issue.number) == Some(&VisitState::Unvisited) {
            let mut path = Vec::new();
            dfs(issue.number, &by_number, &mut state, &mut path, &mut cycles);
        }
    }

    cycles
}

// --- Phase 5: Initial assignments ---

fn validate_initial_assignments(config: &ProjectConfig, num_workers: u32) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    let loc = location(config);
    let mut assigned: HashMap<u32, u32> = HashMap::new();

    for (&worker, &issue) in &config.initial_assignments {
        if worker < 1 || worker > num_workers {
            errors.push(PreflightError {
                condition: format!(
                    "Initial assignment names worker {} but the fleet has workers 1..={}",
                    worker, num_workers
                ),
                config_location: format!("{} → initial_assignments → {}", loc, worker),
                suggested_fix: "Use a worker id within range, or raise num_workers".to_string(),
            });
        }
        if config.get_issue(issue).is_none() {
            errors.push(PreflightError {
                condition: format!(
                    "Initial assignment for worker {} names unknown issue #{}",
                    worker, issue
                ),
                config_location: format!("{} → initial_assignments → {}", loc, worker),
                suggested_fix: "Assign an issue listed under \"issues\"".to_string(),
            });
        }
        if let Some(other) = assigned.insert(issue, worker) {
            errors.push(PreflightError {
                condition: format!(
                    "Issue #{} is initially assigned to both worker {} and worker {}",
                    issue, other, worker
                ),
                config_location: format!("{} → initial_assignments", loc),
                suggested_fix: "Assign each issue to at most one worker".to_string(),
            });
        }
    }

    errors
}
