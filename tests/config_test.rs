mod common;

use std::fs;
use std::path::PathBuf;

use tempfile::tempdir;

use wavecrew::config::{
    load_all_configs, load_project, load_settings, validate_settings, Platform, Settings,
};
use wavecrew::error::FleetError;
use wavecrew::types::{IssueStatus, Stage};

use common::{make_issue, write_project};

// --- Project documents ---

#[test]
fn minimal_document_gets_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alpha-issues.json");
    fs::write(
        &path,
        r#"{
            "project": "alpha",
            "repos": { "core": { "path": "core" } },
            "issues": [ { "number": 3, "title": "Parse headers" } ]
        }"#,
    )
    .unwrap();

    let config = load_project(&path).unwrap();

    assert_eq!(config.pipeline, vec![Stage::Implement]);
    assert_eq!(config.tunables.max_retries, 10);
    assert_eq!(config.tunables.stall_timeout, 900);
    assert_eq!(config.tunables.wall_clock_timeout, 1800);
    assert_eq!(config.tunables.cycle_interval, 60);

    let issue = config.get_issue(3).unwrap();
    assert_eq!(issue.status, IssueStatus::Pending);
    assert_eq!(issue.priority, 1);
    assert_eq!(issue.wave, 99);

    let repo = &config.repos["core"];
    assert_eq!(repo.default_branch, "main");
    assert_eq!(repo.branch_for(3), "issue-3");
    assert_eq!(repo.platform, Platform::Gitlab);
    assert!(repo.path.is_absolute());
    assert!(repo.path.ends_with("core"));
}

#[test]
fn worktree_base_defaults_next_to_the_repo() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alpha-issues.json");
    fs::write(
        &path,
        r#"{ "project": "alpha", "repos": { "core": { "path": "/srv/core", "branch_prefix": "feat/" } } }"#,
    )
    .unwrap();

    let config = load_project(&path).unwrap();
    let repo = &config.repos["core"];

    assert_eq!(repo.worktree_base(), PathBuf::from("/srv/core-worktrees"));
    assert_eq!(
        repo.worktree_for(8),
        PathBuf::from("/srv/core-worktrees/issue-8")
    );
    assert_eq!(repo.branch_for(8), "feat/8");
    assert_eq!(repo.base_ref(), "origin/main");
}

#[test]
fn issue_repo_falls_back_to_first_repo() {
    let dir = tempdir().unwrap();
    let mut issue = make_issue(2, 1, 1, &[]);
    issue.repo = Some("main".to_string());
    let config = write_project(
        dir.path(),
        "alpha",
        &[make_issue(1, 1, 1, &[]), issue],
        &[Stage::Implement],
    );

    let first = config.repo_for_number(1).unwrap();
    let named = config.repo_for_number(2).unwrap();
    assert_eq!(first, named);
    assert!(config.repo_for_number(50).is_some());
}

#[test]
fn unknown_pipeline_stage_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alpha-issues.json");
    fs::write(
        &path,
        r#"{ "project": "alpha", "pipeline": ["implement", "deploy"] }"#,
    )
    .unwrap();

    let err = load_project(&path).unwrap_err();

    assert!(matches!(err, FleetError::Parse { .. }));
    assert!(err.is_fatal());
}

#[test]
fn configs_load_sorted_by_file_name() {
    let dir = tempdir().unwrap();
    write_project(dir.path(), "zeta", &[make_issue(1, 1, 1, &[])], &[Stage::Implement]);
    write_project(dir.path(), "alpha", &[make_issue(1, 1, 1, &[])], &[Stage::Implement]);
    fs::write(dir.path().join("notes.json"), "{}").unwrap();

    let configs = load_all_configs(dir.path()).unwrap();

    let names: Vec<&str> = configs.iter().map(|c| c.project.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[test]
fn empty_config_dir_is_an_error() {
    let dir = tempdir().unwrap();

    let err = load_all_configs(dir.path()).unwrap_err();

    assert!(matches!(err, FleetError::NoConfigs(_)));
}

// --- Settings ---

#[test]
fn missing_settings_file_yields_defaults() {
    let dir = tempdir().unwrap();

    let settings = load_settings(None, dir.path()).unwrap();

    assert_eq!(settings, Settings::default());
    assert_eq!(settings.num_workers, 5);
    assert_eq!(settings.max_retry_rounds, 1);
}

#[test]
fn settings_toml_overrides_fields() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("wavecrew.toml"),
        "num_workers = 3\nsession = \"crew\"\nstagger_delay_secs = 5\n",
    )
    .unwrap();

    let settings = load_settings(None, dir.path()).unwrap();

    assert_eq!(settings.num_workers, 3);
    assert_eq!(settings.session, "crew");
    assert_eq!(settings.stagger_delay_secs, 5);
    assert_eq!(settings.arbiter_timeout_secs, 60);
    assert_eq!(
        settings.state_dir("alpha"),
        PathBuf::from(".wavecrew/state/alpha")
    );
}

#[test]
fn explicit_missing_settings_path_is_an_error() {
    let dir = tempdir().unwrap();

    let err = load_settings(Some(&dir.path().join("nope.toml")), dir.path()).unwrap_err();

    assert!(matches!(err, FleetError::Read { .. }));
}

#[test]
fn invalid_settings_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "num_workers = 0\nsession = \"\"\n").unwrap();

    let err = load_settings(Some(&path), dir.path()).unwrap_err();

    assert!(matches!(err, FleetError::Invalid(_)));
    let message = err.to_string();
    assert!(message.contains("num_workers must be >= 1"));
    assert!(message.contains("session must not be empty"));
}

#[test]
fn validate_settings_collects_every_error() {
    let settings = Settings {
        num_workers: 0,
        agent_command: " ".to_string(),
        command_timeout_secs: 0,
        ..Settings::default()
    };

    let errors = validate_settings(&settings).unwrap_err();

    assert_eq!(errors.len(), 3);
}
