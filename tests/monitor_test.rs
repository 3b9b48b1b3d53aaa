mod common;

use std::fs;
use std::path::Path;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use wavecrew::agent::{MockArbiter, LAUNCH_FAILED_EXIT};
use wavecrew::config::{load_project, ProjectConfig};
use wavecrew::monitor::{Fleet, HaltReason};
use wavecrew::pipeline::RetryStep;
use wavecrew::store::update_issue_status;
use wavecrew::types::{
    Action, Issue, IssueStatus, Stage, Verdict, Worker, WorkerStage, WorkerStatus,
};

use common::{
    make_issue, meaningful_tail, now, running_worker, secs_ago, test_settings, with_status,
    write_project, MockTerminal, MockTracker, MockVcs,
};

type TestFleet = Fleet<MockVcs, MockTerminal, MockTracker, MockArbiter>;

// --- Test helpers ---

fn fleet(
    dir: &Path,
    configs: Vec<ProjectConfig>,
    workers: u32,
    vcs: MockVcs,
    arbiter: MockArbiter,
) -> TestFleet {
    let fleet = Fleet::new(
        configs,
        test_settings(dir, workers),
        vcs,
        MockTerminal::default(),
        MockTracker::default(),
        arbiter,
    )
    .unwrap();
    fleet.store.init().unwrap();
    fleet
}

fn project(dir: &Path, issues: &[Issue]) -> ProjectConfig {
    write_project(dir, "alpha", issues, &[Stage::Implement])
}

/// Worker 1 running issue 1 in a real worktree directory, with `log` as its
/// log and `signal` as its exit code.
fn finished_run(fleet: &TestFleet, config: &ProjectConfig, log: &str, signal: Option<i32>) {
    let mut worker = running_worker(1, 1, config);
    let worktree = fleet.store.state_dir.join("wt-1");
    fs::create_dir_all(&worktree).unwrap();
    worker.worktree = Some(worktree);
    worker.branch = Some("issue-1".to_string());
    worker.stage = Some(WorkerStage::Pipeline(Stage::Implement));
    fleet.store.save_worker(&worker).unwrap();
    fs::write(fleet.store.log_path(1), log).unwrap();
    if let Some(code) = signal {
        fleet.store.write_signal(1, code).unwrap();
    }
}

fn issue_status(config: &ProjectConfig, number: u32) -> IssueStatus {
    load_project(&config.path)
        .unwrap()
        .get_issue(number)
        .unwrap()
        .status
}

fn actions(report: &wavecrew::monitor::CycleReport) -> Vec<(u32, Action)> {
    report
        .decisions
        .iter()
        .map(|d| (d.worker_id, d.action))
        .collect()
}

const CLEAN_LOG: &str = "[DEADMAN] START worker=1 issue=#1 stage=implement time=2026-03-01T11:00:00Z\n\
                         implemented the parser, all tests pass\n\
                         [DEADMAN] EXIT worker=1 code=0 time=2026-03-01T11:30:00Z\n";

// --- Assignment ---

#[tokio::test]
async fn idle_fleet_assigns_distinct_issues_and_launches_agents() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[
            make_issue(1, 1, 1, &[]),
            make_issue(2, 1, 2, &[]),
            make_issue(3, 2, 1, &[1]),
        ],
    );
    let mut fleet = fleet(dir.path(), vec![config.clone()], 3, MockVcs::default(), MockArbiter::new(vec![]));

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(
        actions(&report),
        vec![(1, Action::Reassign), (2, Action::Reassign), (3, Action::Noop)]
    );
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(!report.all_done);

    assert_eq!(issue_status(&config, 1), IssueStatus::InProgress);
    assert_eq!(issue_status(&config, 2), IssueStatus::InProgress);
    assert_eq!(issue_status(&config, 3), IssueStatus::Pending);
    let reloaded = load_project(&config.path).unwrap();
    assert_eq!(reloaded.get_issue(2).unwrap().assigned_worker, Some(2));

    let w1 = fleet.store.load_worker(1).unwrap();
    assert_eq!(w1.status, WorkerStatus::Running);
    assert_eq!(w1.issue_number, Some(1));
    assert_eq!(w1.stage, Some(WorkerStage::Pipeline(Stage::Implement)));
    assert_eq!(w1.source_config.as_deref(), Some(config.id()));
    assert_eq!(w1.branch.as_deref(), Some("issue-1"));
    assert!(w1.worktree.as_ref().unwrap().is_dir());

    let commands = fleet.terminal.commands_for("test:w1");
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("[DEADMAN] EXIT worker=1 code=$code"));
    let log = fs::read_to_string(fleet.store.log_path(1)).unwrap();
    assert!(log.starts_with("[DEADMAN] START worker=1 issue=#1 stage=implement time="));
    assert!(fleet.terminal.commands_for("test:w3").is_empty());

    let prompt = fs::read_to_string(fleet.store.prompt_path(2)).unwrap();
    assert!(prompt.contains("**Issue #2**"));
    assert!(prompt.contains("Body of issue 2"));
    assert_eq!(*fleet.tracker.fetches.lock().unwrap(), vec![1, 2]);
    assert_eq!(fleet.store.cached_issue_body(1).as_deref(), Some("Body of issue 1"));
}

#[tokio::test]
async fn cross_project_reassignment_records_source_config() {
    let dir = tempdir().unwrap();
    let home = write_project(
        dir.path(),
        "alpha",
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::Completed)],
        &[Stage::Implement],
    );
    let other = write_project(dir.path(), "beta", &[make_issue(5, 1, 1, &[])], &[Stage::Implement]);
    let mut fleet = fleet(
        dir.path(),
        vec![home, other.clone()],
        1,
        MockVcs::default(),
        MockArbiter::new(vec![]),
    );

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(actions(&report), vec![(1, Action::ReassignCross)]);
    assert_eq!(issue_status(&other, 5), IssueStatus::InProgress);
    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.source_config.as_deref(), Some(other.id()));
}

// --- Finishing work ---

#[tokio::test]
async fn clean_exit_with_commits_pushes_and_completes() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let mut fleet = fleet(
        dir.path(),
        vec![config.clone()],
        1,
        MockVcs::with_commits("abc1234 add parser (#1)"),
        MockArbiter::new(vec![]),
    );
    finished_run(&fleet, &config, CLEAN_LOG, Some(0));

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(
        actions(&report),
        vec![(1, Action::Push), (1, Action::MarkComplete), (1, Action::Idle)]
    );
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.all_done);
    assert_eq!(issue_status(&config, 1), IssueStatus::Completed);

    let calls = fleet.vcs.calls();
    assert!(calls.contains(&"push issue-1".to_string()));
    assert!(calls.iter().any(|c| c.starts_with("remove ")));

    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.issue_number, None);
    assert_eq!(worker.worktree, None);
    assert_eq!(fleet.store.read_signal(1), None);
    assert_eq!(fleet.arbiter.calls(), 0);
}

#[tokio::test]
async fn failed_push_is_reported_and_cycle_continues() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let vcs = MockVcs {
        fail_push: true,
        ..MockVcs::with_commits("abc1234 add parser (#1)")
    };
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, vcs, MockArbiter::new(vec![]));
    finished_run(&fleet, &config, CLEAN_LOG, Some(0));

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.contains("git push failed"));
    assert_eq!(issue_status(&config, 1), IssueStatus::Completed);

    let events = fs::read_to_string(fleet.events.path()).unwrap();
    assert!(events.contains("\"error\":\"git push failed: remote rejected\""));
}

#[tokio::test]
async fn lost_signal_is_recovered_before_deciding() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, MockVcs::default(), MockArbiter::new(vec![]));
    finished_run(&fleet, &config, CLEAN_LOG, None);

    let report = fleet.run_cycle(1, now()).await;

    assert!(actions(&report).contains(&(1, Action::MarkComplete)));
    let events = fs::read_to_string(fleet.events.path()).unwrap();
    assert!(events.contains("\"signal_recovered\""));
}

#[tokio::test]
async fn arbiter_retry_restarts_with_continuation() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let mut fleet = fleet(
        dir.path(),
        vec![config.clone()],
        1,
        MockVcs::with_commits("abc1234 add parser (#1)"),
        MockArbiter::new(vec![Ok(Verdict::Retry)]),
    );
    let log = "[DEADMAN] START worker=1 issue=#1 stage=implement time=t\n\
               error: 3 tests failed\n\
               [DEADMAN] EXIT worker=1 code=0 time=t\n";
    finished_run(&fleet, &config, log, Some(0));

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(actions(&report), vec![(1, Action::Restart)]);
    assert!(report.decisions[0].continuation);
    assert_eq!(fleet.arbiter.calls(), 1);
    assert_eq!(issue_status(&config, 1), IssueStatus::InProgress);

    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.retry_count, 1);
    assert!(worker.started_at.is_some());
    assert_eq!(fleet.terminal.interrupts.lock().unwrap().len(), 1);

    let prompt = fs::read_to_string(fleet.store.prompt_path(1)).unwrap();
    assert!(prompt.contains("## Continuing Previous Work"));
    assert!(prompt.contains("error: 3 tests failed"));
    let log = fs::read_to_string(fleet.store.log_path(1)).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.starts_with("[DEADMAN] START worker=1 issue=#1 stage=implement"));
}

#[tokio::test]
async fn arbiter_failure_accepts_the_work() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let mut fleet = fleet(
        dir.path(),
        vec![config.clone()],
        1,
        MockVcs::with_commits("abc1234 add parser (#1)"),
        MockArbiter::new(vec![Err("agent CLI unavailable".to_string())]),
    );
    let log = "error: flaky test, rerun passed\n[DEADMAN] EXIT worker=1 code=0 time=t\n";
    finished_run(&fleet, &config, log, Some(0));

    let report = fleet.run_cycle(1, now()).await;

    assert!(actions(&report).contains(&(1, Action::MarkComplete)));
    assert_eq!(fleet.arbiter.calls(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_issue_and_archive_log() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, MockVcs::default(), MockArbiter::new(vec![]));
    let log = format!("{}\n[DEADMAN] EXIT worker=1 code=1 time=t\n", meaningful_tail());
    finished_run(&fleet, &config, &log, Some(1));
    let mut worker = fleet.store.load_worker(1).unwrap();
    worker.retry_count = 10;
    fleet.store.save_worker(&worker).unwrap();

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(actions(&report)[0], (1, Action::Skip));
    assert_eq!(issue_status(&config, 1), IssueStatus::Failed);
    let archived = fs::read_to_string(fleet.store.failure_log_path(1)).unwrap();
    assert!(archived.contains("[DEADMAN] EXIT worker=1 code=1"));
}

#[tokio::test]
async fn unsent_stage_is_rerun_not_counted_as_done() {
    let dir = tempdir().unwrap();
    let config = write_project(
        dir.path(),
        "alpha",
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
        &[Stage::Implement, Stage::WriteTests],
    );
    let mut fleet = fleet(
        dir.path(),
        vec![config.clone()],
        1,
        MockVcs::with_commits("abc1234 add parser (#1)"),
        MockArbiter::new(vec![]),
    );
    finished_run(&fleet, &config, CLEAN_LOG, Some(0));
    *fleet.terminal.fail_commands.lock().unwrap() = Some("tmux timed out".to_string());

    // Cycle 1: implement is done, but write_tests never reaches the pane.
    let report = fleet.run_cycle(1, now()).await;
    assert_eq!(
        actions(&report),
        vec![(1, Action::Push), (1, Action::AdvanceStage)]
    );
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.contains("tmux timed out"));
    assert_eq!(fleet.store.read_signal(1), Some(LAUNCH_FAILED_EXIT));
    let log = fs::read_to_string(fleet.store.log_path(1)).unwrap();
    assert!(log.contains("[DEADMAN] START worker=1 issue=#1 stage=write_tests"));
    assert!(log.lines().last().unwrap().contains("EXIT worker=1 code=127"));

    // Cycle 2: the old clean exit is not reused; write_tests runs again.
    *fleet.terminal.fail_commands.lock().unwrap() = None;
    let report = fleet.run_cycle(2, now()).await;
    assert_eq!(actions(&report), vec![(1, Action::Restart)]);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(issue_status(&config, 1), IssueStatus::InProgress);

    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.stage, Some(WorkerStage::Pipeline(Stage::WriteTests)));
    assert_eq!(fleet.terminal.commands_for("test:w1").len(), 1);
    let prompt = fs::read_to_string(fleet.store.prompt_path(1)).unwrap();
    assert!(prompt.contains("**write_tests** stage"));
}

#[tokio::test]
async fn restart_keeps_the_wall_clock_running() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[with_status(make_issue(1, 1, 1, &[]), IssueStatus::InProgress)],
    );
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, MockVcs::default(), MockArbiter::new(vec![]));
    let log = format!("{}\n[DEADMAN] EXIT worker=1 code=1 time=t\n", meaningful_tail());
    finished_run(&fleet, &config, &log, Some(1));
    let mut worker = fleet.store.load_worker(1).unwrap();
    worker.started_at = Some(secs_ago(1000));
    fleet.store.save_worker(&worker).unwrap();

    let report = fleet.run_cycle(1, now()).await;
    assert_eq!(actions(&report), vec![(1, Action::Restart)]);
    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.retry_count, 1);
    assert_eq!(worker.started_at, Some(secs_ago(1000)));

    // 1900s after the first start the ceiling applies to the restarted run.
    fleet.terminal.set_alive("test:w1", true);
    *fleet.vcs.commits.lock().unwrap() = "def5678 wip (#1)".to_string();
    let later = now() + chrono::Duration::seconds(900);
    let report = fleet.run_cycle(2, later).await;

    assert_eq!(
        actions(&report),
        vec![(1, Action::Push), (1, Action::MarkComplete), (1, Action::Idle)]
    );
    assert!(report.decisions[1].reason.contains("wall-clock limit hit (1900s > 1800s)"));
    assert_eq!(issue_status(&config, 1), IssueStatus::Completed);
}

#[tokio::test]
async fn assignment_without_a_document_claim_leaves_worker_free() {
    let dir = tempdir().unwrap();
    let config = project(dir.path(), &[make_issue(1, 1, 1, &[])]);
    let vcs = MockVcs {
        remove_on_worktree: Some(config.path.clone()),
        ..MockVcs::default()
    };
    let mut fleet = fleet(dir.path(), vec![config], 1, vcs, MockArbiter::new(vec![]));

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(actions(&report), vec![(1, Action::Reassign)]);
    assert_eq!(report.failures.len(), 1);
    let worker = fleet.store.load_or_idle(1);
    assert_eq!(worker.issue_number, None);
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(fleet.terminal.commands().is_empty());
}

#[tokio::test]
async fn unsaved_worker_record_releases_the_claim() {
    let dir = tempdir().unwrap();
    let config = project(dir.path(), &[make_issue(1, 1, 1, &[])]);
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, MockVcs::default(), MockArbiter::new(vec![]));
    let workers_dir = fleet.store.state_dir.join("workers");
    fs::remove_dir_all(&workers_dir).unwrap();
    fs::write(&workers_dir, "").unwrap();

    let report = fleet.run_cycle(1, now()).await;

    assert_eq!(actions(&report), vec![(1, Action::Reassign)]);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.contains("Failed to record W1 on #1"));
    let reloaded = load_project(&config.path).unwrap();
    let issue = reloaded.get_issue(1).unwrap();
    assert_eq!(issue.status, IssueStatus::Pending);
    assert_eq!(issue.assigned_worker, None);
    assert!(fleet.terminal.commands().is_empty());
}

// --- Retry workflow ---

#[tokio::test]
async fn failed_issue_goes_through_analyze_explore_resume() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[
            with_status(make_issue(1, 1, 1, &[]), IssueStatus::Failed),
            make_issue(2, 2, 1, &[1]),
        ],
    );
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, MockVcs::default(), MockArbiter::new(vec![]));
    fs::write(fleet.store.failure_log_path(1), "error: borrow of moved value").unwrap();

    // Cycle 1: nothing eligible, so the failed issue is retried.
    let report = fleet.run_cycle(1, now()).await;
    assert_eq!(actions(&report), vec![(1, Action::RetryFailed)]);
    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.stage, Some(WorkerStage::RetryAnalyze));
    let reloaded = load_project(&config.path).unwrap();
    assert_eq!(reloaded.get_issue(1).unwrap().retry_rounds, 1);
    assert_eq!(reloaded.get_issue(1).unwrap().status, IssueStatus::InProgress);
    let prompt = fs::read_to_string(fleet.store.prompt_path(1)).unwrap();
    assert!(prompt.contains("diagnosing a failed attempt at issue #1"));
    assert!(prompt.contains("failures/issue-1.log"));

    // Cycle 2: analysis finished; explore appends to the same log.
    fs::write(fleet.store.log_path(1), "Root cause: moved value in loop\n").unwrap();
    fleet.store.write_signal(1, 0).unwrap();
    let report = fleet.run_cycle(2, now()).await;
    assert!(report.decisions.is_empty());
    assert_eq!(report.retry_steps, vec![(1, RetryStep::Explore { timed_out: false })]);
    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.stage, Some(WorkerStage::RetryExplore));
    assert_eq!(fleet.terminal.commands_for("test:w1").len(), 2);
    let log = fs::read_to_string(fleet.store.log_path(1)).unwrap();
    assert!(log.starts_with("Root cause: moved value in loop\n"));
    assert!(log.contains("[DEADMAN] START worker=1 issue=#1 stage=retry_explore"));

    // Cycle 3: exploration finished; the stage resumes with the findings.
    let mut log = log;
    log.push_str("Approach 1: clone before the loop\n");
    fs::write(fleet.store.log_path(1), log).unwrap();
    fleet.store.write_signal(1, 0).unwrap();
    let report = fleet.run_cycle(3, now()).await;
    assert_eq!(report.retry_steps, vec![(1, RetryStep::Resume { timed_out: false })]);
    let worker = fleet.store.load_worker(1).unwrap();
    assert_eq!(worker.stage, Some(WorkerStage::Pipeline(Stage::Implement)));
    assert_eq!(worker.retry_count, 0);
    let prompt = fs::read_to_string(fleet.store.prompt_path(1)).unwrap();
    assert!(prompt.contains("## Previous Failure Analysis"));
    assert!(prompt.contains("Root cause: moved value in loop"));
    assert!(prompt.contains("Approach 1: clone before the loop"));
    assert_eq!(fleet.terminal.commands_for("test:w1").len(), 3);
}

// --- Run loop ---

#[tokio::test]
async fn run_stops_when_everything_is_settled() {
    let dir = tempdir().unwrap();
    let config = project(
        dir.path(),
        &[
            with_status(make_issue(1, 1, 1, &[]), IssueStatus::Completed),
            with_status(make_issue(2, 1, 1, &[]), IssueStatus::Completed),
        ],
    );
    let mut fleet = fleet(dir.path(), vec![config], 2, MockVcs::default(), MockArbiter::new(vec![]));

    let summary = fleet.run(CancellationToken::new(), Some(5)).await.unwrap();

    assert_eq!(summary.halt_reason, HaltReason::AllDone);
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.counts.completed, 2);
}

#[tokio::test]
async fn failed_dependency_does_not_keep_the_fleet_alive() {
    let dir = tempdir().unwrap();
    let mut failed = with_status(make_issue(1, 1, 1, &[]), IssueStatus::Failed);
    failed.retry_rounds = 1;
    let config = project(dir.path(), &[failed, make_issue(2, 2, 1, &[1])]);
    let mut fleet = fleet(dir.path(), vec![config], 1, MockVcs::default(), MockArbiter::new(vec![]));

    let summary = fleet.run(CancellationToken::new(), Some(3)).await.unwrap();

    assert_eq!(summary.halt_reason, HaltReason::AllDone);
    assert_eq!(summary.counts.pending, 1);
    assert_eq!(summary.counts.failed, 1);
}

#[tokio::test]
async fn run_honours_cycle_limit_and_cancellation() {
    let dir = tempdir().unwrap();
    let config = project(dir.path(), &[make_issue(1, 1, 1, &[])]);
    let mut fleet = fleet(dir.path(), vec![config], 1, MockVcs::default(), MockArbiter::new(vec![]));

    let summary = fleet.run(CancellationToken::new(), Some(1)).await.unwrap();
    assert_eq!(summary.halt_reason, HaltReason::CycleLimit);
    assert_eq!(summary.counts.in_progress, 1);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = fleet.run(cancel, None).await.unwrap();
    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert_eq!(summary.cycles, 0);
}

#[tokio::test]
async fn external_status_edits_are_seen_next_cycle() {
    let dir = tempdir().unwrap();
    let config = project(dir.path(), &[make_issue(1, 1, 1, &[]), make_issue(2, 2, 1, &[])]);
    let mut fleet = fleet(dir.path(), vec![config.clone()], 1, MockVcs::default(), MockArbiter::new(vec![]));
    update_issue_status(&config.path, 1, IssueStatus::Completed, None).unwrap();

    let report = fleet.run_cycle(1, now()).await;

    let assigned = report.decisions[0].new_issue;
    assert_eq!(assigned, Some(2));
}

// --- Launch ---

#[tokio::test]
async fn launch_creates_windows_and_honours_initial_assignments() {
    let dir = tempdir().unwrap();
    let config = project(dir.path(), &[make_issue(1, 1, 1, &[]), make_issue(2, 2, 1, &[])]);
    let mut doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config.path).unwrap()).unwrap();
    doc["initial_assignments"] = serde_json::json!({ "2": 2 });
    fs::write(&config.path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    let config = load_project(&config.path).unwrap();

    let fleet = fleet(dir.path(), vec![config.clone()], 2, MockVcs::default(), MockArbiter::new(vec![]));
    fleet.launch().await.unwrap();

    assert_eq!(
        *fleet.terminal.windows.lock().unwrap(),
        vec!["test:w1".to_string(), "test:w2".to_string()]
    );
    assert_eq!(fleet.store.load_worker(1), Some(Worker::idle(1)));
    let w2 = fleet.store.load_worker(2).unwrap();
    assert_eq!(w2.issue_number, Some(2));
    assert_eq!(issue_status(&config, 2), IssueStatus::InProgress);
    assert_eq!(issue_status(&config, 1), IssueStatus::Pending);

    // A second launch finds the session and the busy worker and changes nothing.
    fleet.launch().await.unwrap();
    assert_eq!(fleet.terminal.windows.lock().unwrap().len(), 2);
    assert_eq!(fleet.terminal.commands_for("test:w2").len(), 1);
}
