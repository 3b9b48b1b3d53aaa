use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::log_debug;
use crate::prompt;
use crate::types::{Verdict, WorkerStage};

/// Prefix of the start/exit markers a worker's shell wrapper writes into its log.
pub const SENTINEL_PREFIX: &str = "[DEADMAN]";

/// Characters of log handed to the arbiter.
pub const ARBITER_LOG_CHARS: usize = 2000;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Sentinels ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Start,
    Exit(i32),
}

fn parse_sentinel(line: &str) -> Option<Sentinel> {
    let rest = line.trim().strip_prefix(SENTINEL_PREFIX)?.trim_start();
    if rest.starts_with("START") {
        return Some(Sentinel::Start);
    }
    if rest.starts_with("EXIT") {
        let code = rest
            .split_whitespace()
            .find_map(|field| field.strip_prefix("code="))?
            .parse()
            .ok()?;
        return Some(Sentinel::Exit(code));
    }
    None
}

/// The last start/exit marker in `log`, if any.
///
/// An `Exit` here means the most recent run finished; a `Start` means it is
/// still running or died without reaching its exit marker.
pub fn last_sentinel(log: &str) -> Option<Sentinel> {
    log.lines().rev().find_map(parse_sentinel)
}

/// Log text with sentinel lines removed.
pub fn strip_sentinels(log: &str) -> String {
    log.lines()
        .filter(|l| !l.trim_start().starts_with(SENTINEL_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Launch command ---

/// Exit code recorded when the launch command never reached the worker's pane.
pub const LAUNCH_FAILED_EXIT: i32 = 127;

fn sentinel_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// START marker for one run. Written by the monitor before the command is sent.
pub fn start_sentinel(worker_id: u32, issue: u32, stage: WorkerStage, at: DateTime<Utc>) -> String {
    format!(
        "{} START worker={} issue=#{} stage={} time={}",
        SENTINEL_PREFIX,
        worker_id,
        issue,
        stage,
        sentinel_time(at)
    )
}

/// EXIT marker for a run that never started, matching what the shell wrapper writes.
pub fn exit_sentinel(worker_id: u32, code: i32, at: DateTime<Utc>) -> String {
    format!(
        "{} EXIT worker={} code={} time={}",
        SENTINEL_PREFIX,
        worker_id,
        code,
        sentinel_time(at)
    )
}

/// Everything needed to start one agent run inside a worker's pane.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub worker_id: u32,
    pub worktree: &'a Path,
    pub prompt_path: &'a Path,
    pub log_path: &'a Path,
    pub signal_path: &'a Path,
}

/// Single-quote a value for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Shell line that runs the agent and leaves an exit code behind.
///
/// The START sentinel is already in the log; the wrapper appends the agent's
/// output and the EXIT sentinel, then writes the signal file last, so a lost
/// signal can be recovered from the EXIT sentinel.
pub fn build_launch_command(agent_command: &str, spec: &LaunchSpec) -> String {
    let log = quote_path(spec.log_path);

    format!(
        "cd {wt} && {agent} \"$(cat {prompt})\" >> {log} 2>&1; code=$?; \
         echo \"{p} EXIT worker={w} code=$code time=$(date -u +%Y-%m-%dT%H:%M:%SZ)\" >> {log}; \
         echo $code > {signal}",
        wt = quote_path(spec.worktree),
        agent = agent_command,
        prompt = quote_path(spec.prompt_path),
        log = log,
        p = SENTINEL_PREFIX,
        w = spec.worker_id,
        signal = quote_path(spec.signal_path),
    )
}

// --- Subprocesses ---

/// Run a command to completion under a timeout and return its stdout.
///
/// Non-zero exit, spawn failure and timeout all become `Err`; the child is
/// killed if the timeout fires.
pub async fn run_captured(
    mut cmd: tokio::process::Command,
    label: &str,
    timeout: Duration,
) -> Result<String, String> {
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);

    log_debug!("[cmd] {} (timeout={}s)", label, timeout.as_secs());
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => return Err(format!("{} timed out after {}s", label, timeout.as_secs())),
        Ok(Err(e)) => return Err(format!("Failed to run {}: {}", label, e)),
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} failed: {}", label, stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// --- Arbiter ---

/// What the arbiter sees when a run exited cleanly but its log mentions errors.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterContext {
    pub worker_id: u32,
    pub issue_number: u32,
    pub commits: String,
    /// Last `ARBITER_LOG_CHARS` characters of the worker log.
    pub log_excerpt: String,
}

/// Resolves ambiguous successes. Callers bound the call with a timeout and
/// treat failure as accept.
pub trait Arbiter: Send + Sync {
    fn resolve_ambiguous(
        &self,
        context: &ArbiterContext,
    ) -> impl std::future::Future<Output = Result<Verdict, String>> + Send;
}

/// Asks the agent CLI itself to answer A (accept) or B (retry).
pub struct CliArbiter {
    pub command: String,
    pub timeout: Duration,
}

impl CliArbiter {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }
}

/// Read an arbiter reply: the first letter decides.
pub fn parse_verdict(reply: &str) -> Result<Verdict, String> {
    match reply.trim_start().chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('A') => Ok(Verdict::Accept),
        Some('B') => Ok(Verdict::Retry),
        _ => Err(format!(
            "Unrecognized arbiter reply: {:?}",
            reply.chars().take(40).collect::<String>()
        )),
    }
}

impl Arbiter for CliArbiter {
    async fn resolve_ambiguous(&self, context: &ArbiterContext) -> Result<Verdict, String> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| "Arbiter command is empty".to_string())?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts);
        cmd.arg(prompt::arbiter_prompt(context));

        let reply = run_captured(cmd, "arbiter", self.timeout).await?;
        parse_verdict(&reply)
    }
}

/// Mock arbiter for orchestration tests.
///
/// Returns predefined verdicts in order; once exhausted, every call fails.
pub struct MockArbiter {
    verdicts: tokio::sync::Mutex<Vec<Result<Verdict, String>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockArbiter {
    pub fn new(verdicts: Vec<Result<Verdict, String>>) -> Self {
        let mut reversed = verdicts;
        reversed.reverse();
        Self {
            verdicts: tokio::sync::Mutex::new(reversed),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Arbiter for MockArbiter {
    async fn resolve_ambiguous(&self, _context: &ArbiterContext) -> Result<Verdict, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut verdicts = self.verdicts.lock().await;
        verdicts
            .pop()
            .unwrap_or_else(|| Err("MockArbiter: no more verdicts".to_string()))
    }
}
