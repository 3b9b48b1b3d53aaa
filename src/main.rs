use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use wavecrew::agent::{install_signal_handlers, is_shutdown_requested, CliArbiter};
use wavecrew::config::{self, ProjectConfig, Settings};
use wavecrew::git::GitCli;
use wavecrew::issues::{blocked_issues, count_issues, IssueCounts};
use wavecrew::lock;
use wavecrew::log::parse_log_level;
use wavecrew::monitor::{Fleet, HaltReason};
use wavecrew::pipeline::stage_label;
use wavecrew::preflight;
use wavecrew::store::{self, StateStore};
use wavecrew::tmux::Tmux;
use wavecrew::tracker::CliTracker;
use wavecrew::types::{Issue, IssueStatus};
use wavecrew::{log_error, log_info, log_warn};

type CliFleet = Fleet<GitCli, Tmux, CliTracker, CliArbiter>;

#[derive(Parser)]
#[command(
    name = "wavecrew",
    about = "Drive a fleet of coding agents through dependency-ordered issue waves"
)]
struct Cli {
    /// Directory holding the `*-issues.json` project configurations
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Orchestrator settings file (defaults to {config-dir}/wavecrew.toml)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every project configuration and the settings
    Validate,
    /// Create the worker session and start the initial assignments
    Launch {
        /// Keep running the monitor loop after launching
        #[arg(long)]
        monitor: bool,
    },
    /// Run the monitor loop until all work is settled
    Monitor {
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Show issue progress and worker state
    Status,
    /// Append a new issue to a project configuration
    AddIssue {
        /// Issue number on the tracker
        number: u32,
        /// Project name of the configuration to add to
        #[arg(long)]
        config: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "1")]
        priority: u32,
        #[arg(long, default_value = "99")]
        wave: u32,
        /// Issue numbers this one depends on (repeatable)
        #[arg(long = "depends-on", action = clap::ArgAction::Append)]
        depends_on: Vec<u32>,
        /// Repository name (defaults to the project's first repository)
        #[arg(long)]
        repo: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => wavecrew::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let config_dir = &cli.config_dir;
    let settings_path = cli.settings.as_deref();

    let result = match cli.command {
        Commands::Validate => handle_validate(config_dir, settings_path),
        Commands::Launch { monitor } => handle_launch(config_dir, settings_path, monitor).await,
        Commands::Monitor { cycles } => handle_monitor(config_dir, settings_path, cycles).await,
        Commands::Status => handle_status(config_dir, settings_path),
        Commands::AddIssue {
            number,
            config,
            title,
            priority,
            wave,
            depends_on,
            repo,
        } => {
            let mut issue = Issue::new(number, &title);
            issue.priority = priority;
            issue.wave = wave;
            issue.depends_on = depends_on;
            issue.repo = repo;
            handle_add_issue(config_dir, &config, issue)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load(
    config_dir: &Path,
    settings_path: Option<&Path>,
) -> Result<(Vec<ProjectConfig>, Settings), String> {
    let settings = config::load_settings(settings_path, config_dir).map_err(String::from)?;
    let configs = config::load_all_configs(config_dir).map_err(String::from)?;
    Ok((configs, settings))
}

fn run_preflight(configs: &[ProjectConfig], settings: &Settings) -> Result<(), String> {
    log_info!("[pre] Running preflight checks...");
    if let Err(errors) = preflight::run_preflight(configs, settings) {
        log_error!("[pre] Preflight FAILED:");
        for error in &errors {
            log_error!("  {}", error);
        }
        return Err(format!(
            "{} preflight error(s); fix all issues before running",
            errors.len()
        ));
    }
    log_info!("[pre] Preflight passed.");
    Ok(())
}

fn build_fleet(configs: Vec<ProjectConfig>, settings: Settings) -> Result<CliFleet, String> {
    let timeout = Duration::from_secs(settings.command_timeout_secs);
    let arbiter = CliArbiter::new(
        &settings.agent_command,
        Duration::from_secs(settings.arbiter_timeout_secs),
    );
    let terminal = Tmux::new(timeout, &settings.agent_process);
    Fleet::new(
        configs,
        settings,
        GitCli::new(timeout),
        terminal,
        CliTracker::new(timeout),
        arbiter,
    )
    .map_err(String::from)
}

fn handle_validate(config_dir: &Path, settings_path: Option<&Path>) -> Result<(), String> {
    let (configs, settings) = load(config_dir, settings_path)?;
    if let Err(errors) = preflight::run_preflight(&configs, &settings) {
        println!("{}", preflight::render(&errors));
        return Err(format!("{} preflight error(s)", errors.len()));
    }

    for config in &configs {
        println!(
            "{}: {} issue(s), {} repo(s), pipeline [{}]",
            config.project,
            config.issues.len(),
            config.repos.len(),
            config
                .pipeline
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" → ")
        );
    }
    println!("Configuration OK");
    Ok(())
}

async fn handle_launch(
    config_dir: &Path,
    settings_path: Option<&Path>,
    monitor: bool,
) -> Result<(), String> {
    let (configs, settings) = load(config_dir, settings_path)?;
    run_preflight(&configs, &settings)?;

    let mut fleet = build_fleet(configs, settings)?;
    log_info!("[pre] Acquiring monitor lock...");
    let _lock = lock::try_acquire(&fleet.store)?;

    fleet.launch().await?;
    log_info!(
        "[launch] Fleet ready in session '{}'",
        fleet.settings.session
    );

    if monitor {
        run_monitor(&mut fleet, None).await?;
    }
    Ok(())
}

async fn handle_monitor(
    config_dir: &Path,
    settings_path: Option<&Path>,
    cycles: Option<u64>,
) -> Result<(), String> {
    let (configs, settings) = load(config_dir, settings_path)?;
    run_preflight(&configs, &settings)?;

    let mut fleet = build_fleet(configs, settings)?;
    log_info!("[pre] Acquiring monitor lock...");
    let _lock = lock::try_acquire(&fleet.store)?;

    run_monitor(&mut fleet, cycles).await
}

async fn run_monitor(fleet: &mut CliFleet, cycles: Option<u64>) -> Result<(), String> {
    install_signal_handlers()?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let summary = fleet.run(cancel, cycles).await?;

    log_info!("\n--- Run Summary ---");
    log_info!("Cycles: {}", summary.cycles);
    log_info!("Issues: {}", summary.counts);
    match summary.halt_reason {
        HaltReason::AllDone => log_info!("Halt reason: all issues settled"),
        HaltReason::ShutdownRequested => log_info!("Halt reason: shutdown requested"),
        HaltReason::CycleLimit => log_info!("Halt reason: cycle limit reached"),
    }

    for config in &fleet.configs {
        for issue in config
            .issues
            .iter()
            .filter(|i| i.status == IssueStatus::Failed)
        {
            log_warn!("  Failed: {} #{} {}", config.project, issue.number, issue.title);
        }
    }
    Ok(())
}

fn handle_status(config_dir: &Path, settings_path: Option<&Path>) -> Result<(), String> {
    let (configs, settings) = load(config_dir, settings_path)?;

    let mut total = IssueCounts::default();
    for config in &configs {
        let counts = count_issues(&config.issues);
        total.add(counts);
        println!("{}: {}", config.project, counts);

        for issue in config
            .issues
            .iter()
            .filter(|i| i.status == IssueStatus::InProgress)
        {
            println!(
                "  #{} {} [{}] worker={}",
                issue.number,
                issue.title,
                stage_label(config, issue),
                issue
                    .assigned_worker
                    .map(|w| format!("W{}", w))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        for (number, missing) in blocked_issues(&config.issues) {
            let missing: Vec<String> = missing.iter().map(|n| format!("#{}", n)).collect();
            println!("  #{} blocked on {}", number, missing.join(", "));
        }
    }
    if configs.len() > 1 {
        println!("total: {}", total);
    }

    let Some(home) = configs.first() else {
        return Ok(());
    };
    let store = StateStore::new(
        &settings.state_dir(&home.project),
        &settings.scratch_dir,
        &home.project,
    );
    println!();
    for id in 1..=settings.num_workers {
        match store.load_worker(id) {
            Some(w) => println!(
                "W{}: {} issue={} stage={} retries={}",
                id,
                w.status,
                w.issue_number
                    .map(|n| format!("#{}", n))
                    .unwrap_or_else(|| "-".to_string()),
                w.stage
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                w.retry_count
            ),
            None => println!("W{}: no record", id),
        }
    }
    Ok(())
}

fn handle_add_issue(config_dir: &Path, project: &str, issue: Issue) -> Result<(), String> {
    let configs = config::load_all_configs(config_dir).map_err(String::from)?;
    let config = configs
        .iter()
        .find(|c| c.project == project)
        .ok_or_else(|| {
            let names: Vec<&str> = configs.iter().map(|c| c.project.as_str()).collect();
            format!(
                "No project named '{}' (known: {})",
                project,
                names.join(", ")
            )
        })?;

    let mut candidate = config.clone();
    candidate.issues.push(issue.clone());
    let errors = preflight::validate_dependency_graph(&candidate);
    if !errors.is_empty() {
        return Err(format!(
            "Issue #{} would break the dependency graph:\n{}",
            issue.number,
            preflight::render(&errors)
        ));
    }

    store::insert_issue(&config.path, &issue).map_err(String::from)?;
    println!(
        "Added #{} to {} (wave {}, priority {})",
        issue.number, config.project, issue.wave, issue.priority
    );
    Ok(())
}
