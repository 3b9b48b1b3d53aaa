use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::agent::{last_sentinel, Sentinel};
use crate::error::FleetError;
use crate::log_warn;
use crate::types::{Issue, IssueStatus, Worker};

/// Bytes read from the end of a log when only the tail is needed.
const TAIL_READ_BYTES: u64 = 64 * 1024;

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> FleetError + '_ {
    move |source| FleetError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Replace `path` with `contents` atomically.
///
/// Writes a temporary file in the same directory, syncs it, then renames it
/// over the target, so readers see either the old file or the new one.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), FleetError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err(parent))?;

    let mut temp_file = NamedTempFile::new_in(parent).map_err(write_err(parent))?;
    temp_file.write_all(contents).map_err(write_err(path))?;
    temp_file.as_file().sync_all().map_err(write_err(path))?;
    temp_file
        .persist(path)
        .map_err(|e| write_err(path)(e.error))?;

    Ok(())
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FleetError> {
    let mut json = serde_json::to_string_pretty(value).map_err(|source| FleetError::Serialize {
        what: path.display().to_string(),
        source,
    })?;
    json.push('\n');
    atomic_write(path, json.as_bytes())
}

// --- Configuration document mutation ---

fn read_document(path: &Path) -> Result<serde_json::Value, FleetError> {
    let contents = fs::read_to_string(path).map_err(|source| FleetError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| FleetError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Re-read the document, apply `mutate` to one issue record, and rewrite it.
///
/// Everything outside the touched fields, including unknown keys, is kept.
fn update_issue_record<F>(path: &Path, number: u32, mutate: F) -> Result<(), FleetError>
where
    F: FnOnce(&mut serde_json::Map<String, serde_json::Value>),
{
    let mut doc = read_document(path)?;
    let record = doc
        .get_mut("issues")
        .and_then(|v| v.as_array_mut())
        .and_then(|issues| {
            issues
                .iter_mut()
                .find(|i| i.get("number").and_then(|n| n.as_u64()) == Some(u64::from(number)))
        })
        .and_then(|i| i.as_object_mut())
        .ok_or_else(|| FleetError::IssueNotFound {
            number,
            path: path.to_path_buf(),
        })?;

    mutate(record);
    write_json(path, &doc)
}

/// Persist an issue's status and assignment in its configuration document.
pub fn update_issue_status(
    path: &Path,
    number: u32,
    status: IssueStatus,
    assigned_worker: Option<u32>,
) -> Result<(), FleetError> {
    update_issue_record(path, number, |record| {
        record.insert("status".to_string(), serde_json::json!(status));
        record.insert(
            "assigned_worker".to_string(),
            serde_json::json!(assigned_worker),
        );
    })
}

pub fn set_pipeline_stage(path: &Path, number: u32, stage: usize) -> Result<(), FleetError> {
    update_issue_record(path, number, |record| {
        record.insert("pipeline_stage".to_string(), serde_json::json!(stage));
    })
}

/// Count one more diagnose/retry round against the issue.
pub fn bump_retry_rounds(path: &Path, number: u32) -> Result<(), FleetError> {
    update_issue_record(path, number, |record| {
        let rounds = record
            .get("retry_rounds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        record.insert("retry_rounds".to_string(), serde_json::json!(rounds + 1));
    })
}

/// Fresh copy of one issue from the document on disk.
pub fn read_issue(path: &Path, number: u32) -> Result<Issue, FleetError> {
    let doc = read_document(path)?;
    let record = doc
        .get("issues")
        .and_then(|v| v.as_array())
        .and_then(|issues| {
            issues
                .iter()
                .find(|i| i.get("number").and_then(|n| n.as_u64()) == Some(u64::from(number)))
        })
        .ok_or_else(|| FleetError::IssueNotFound {
            number,
            path: path.to_path_buf(),
        })?;

    serde_json::from_value(record.clone()).map_err(|source| FleetError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Append a new issue to the document. Rejects duplicate numbers.
pub fn insert_issue(path: &Path, issue: &Issue) -> Result<(), FleetError> {
    let mut doc = read_document(path)?;
    let value = serde_json::to_value(issue).map_err(|source| FleetError::Serialize {
        what: format!("issue #{}", issue.number),
        source,
    })?;

    let root = doc.as_object_mut().ok_or_else(|| {
        FleetError::Invalid(format!("{} is not a JSON object", path.display()))
    })?;
    let issues = root
        .entry("issues")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| FleetError::Invalid(format!("{} → issues is not an array", path.display())))?;

    if issues
        .iter()
        .any(|i| i.get("number").and_then(|n| n.as_u64()) == Some(u64::from(issue.number)))
    {
        return Err(FleetError::DuplicateIssue {
            number: issue.number,
            path: path.to_path_buf(),
        });
    }

    issues.push(value);
    write_json(path, &doc)
}

// --- Per-fleet state ---

/// Worker records, scratch files and caches for one fleet.
///
/// Durable state lives in `state_dir`; signal, log and prompt files live in
/// `scratch_dir` and are named after `namespace`.
#[derive(Debug, Clone)]
pub struct StateStore {
    pub state_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub namespace: String,
}

impl StateStore {
    pub fn new(state_dir: &Path, scratch_dir: &Path, namespace: &str) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
            namespace: namespace.to_string(),
        }
    }

    /// Create the state directory layout.
    pub fn init(&self) -> Result<(), FleetError> {
        for dir in [
            self.workers_dir(),
            self.cache_dir(),
            self.failures_dir(),
            self.scratch_dir.clone(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| FleetError::Write { path: dir, source })?;
        }
        Ok(())
    }

    fn workers_dir(&self) -> PathBuf {
        self.state_dir.join("workers")
    }

    fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("issue-cache")
    }

    fn failures_dir(&self) -> PathBuf {
        self.state_dir.join("failures")
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.state_dir.join("orchestrator-log.jsonl")
    }

    pub fn worker_path(&self, worker_id: u32) -> PathBuf {
        self.workers_dir().join(format!("worker-{}.json", worker_id))
    }

    pub fn signal_path(&self, worker_id: u32) -> PathBuf {
        self.scratch_dir
            .join(format!("{}-signal-{}", self.namespace, worker_id))
    }

    pub fn log_path(&self, worker_id: u32) -> PathBuf {
        self.scratch_dir
            .join(format!("{}-worker-{}.log", self.namespace, worker_id))
    }

    pub fn prompt_path(&self, worker_id: u32) -> PathBuf {
        self.scratch_dir
            .join(format!("{}-worker-prompt-{}.md", self.namespace, worker_id))
    }

    pub fn failure_log_path(&self, issue: u32) -> PathBuf {
        self.failures_dir().join(format!("issue-{}.log", issue))
    }

    // --- Worker records ---

    /// Load a worker record. Missing or malformed records read as absent.
    pub fn load_worker(&self, worker_id: u32) -> Option<Worker> {
        let path = self.worker_path(worker_id);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(worker) => Some(worker),
            Err(e) => {
                log_warn!(
                    "[store] Ignoring malformed worker record {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn load_or_idle(&self, worker_id: u32) -> Worker {
        self.load_worker(worker_id)
            .unwrap_or_else(|| Worker::idle(worker_id))
    }

    pub fn save_worker(&self, worker: &Worker) -> Result<(), FleetError> {
        write_json(&self.worker_path(worker.worker_id), worker)
    }

    // --- Signals ---

    /// Exit code from the worker's signal file, if present and readable.
    pub fn read_signal(&self, worker_id: u32) -> Option<i32> {
        fs::read_to_string(self.signal_path(worker_id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_signal(&self, worker_id: u32, code: i32) -> Result<(), FleetError> {
        atomic_write(&self.signal_path(worker_id), format!("{}\n", code).as_bytes())
    }

    pub fn clear_signal(&self, worker_id: u32) -> Result<(), FleetError> {
        let path = self.signal_path(worker_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FleetError::Write { path, source }),
        }
    }

    /// Rebuild a lost signal file from the log's EXIT sentinel.
    ///
    /// Only applies when no signal file exists and the last sentinel in the
    /// log is an EXIT; returns the recovered exit code.
    pub fn recover_signal(&self, worker_id: u32) -> Option<i32> {
        if self.signal_path(worker_id).exists() {
            return None;
        }
        let Some(Sentinel::Exit(code)) = last_sentinel(&self.read_log(worker_id)) else {
            return None;
        };
        match self.write_signal(worker_id, code) {
            Ok(()) => Some(code),
            Err(e) => {
                log_warn!("[store] Failed to restore signal for W{}: {}", worker_id, e);
                Some(code)
            }
        }
    }

    // --- Logs ---

    /// Size in bytes and modification time of the worker log.
    pub fn log_stats(&self, worker_id: u32) -> (u64, Option<DateTime<Utc>>) {
        match fs::metadata(self.log_path(worker_id)) {
            Ok(meta) => (
                meta.len(),
                meta.modified().ok().map(DateTime::<Utc>::from),
            ),
            Err(_) => (0, None),
        }
    }

    pub fn read_log(&self, worker_id: u32) -> String {
        fs::read(self.log_path(worker_id))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    /// Last `lines` lines of the worker log.
    pub fn log_tail(&self, worker_id: u32, lines: usize) -> String {
        let Ok(mut file) = fs::File::open(self.log_path(worker_id)) else {
            return String::new();
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let start = len.saturating_sub(TAIL_READ_BYTES);
        if file.seek(SeekFrom::Start(start)).is_err() {
            return String::new();
        }
        let mut bytes = Vec::new();
        if file.read_to_end(&mut bytes).is_err() {
            return String::new();
        }
        let text = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    pub fn truncate_log(&self, worker_id: u32) -> Result<(), FleetError> {
        let path = self.log_path(worker_id);
        fs::write(&path, b"").map_err(|source| FleetError::Write { path, source })
    }

    /// Append one line to the worker log, creating it if needed.
    pub fn append_log(&self, worker_id: u32, line: &str) -> Result<(), FleetError> {
        let path = self.log_path(worker_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(write_err(&path))?;
        writeln!(file, "{}", line).map_err(write_err(&path))
    }

    /// Open a new run in the worker log: start fresh unless `append`, then
    /// write the run's START sentinel.
    ///
    /// The sentinel is on disk before the agent command is sent, so an EXIT
    /// left by an earlier run is never the last marker of this one.
    pub fn begin_run(&self, worker_id: u32, start_line: &str, append: bool) -> Result<(), FleetError> {
        if !append {
            self.truncate_log(worker_id)?;
        }
        self.append_log(worker_id, start_line)
    }

    /// Keep the worker's log for a later retry round of `issue`.
    pub fn archive_failure_log(&self, worker_id: u32, issue: u32) -> Result<PathBuf, FleetError> {
        let dest = self.failure_log_path(issue);
        atomic_write(&dest, self.read_log(worker_id).as_bytes())?;
        Ok(dest)
    }

    pub fn write_prompt(&self, worker_id: u32, prompt: &str) -> Result<PathBuf, FleetError> {
        let path = self.prompt_path(worker_id);
        atomic_write(&path, prompt.as_bytes())?;
        Ok(path)
    }

    // --- Issue body cache ---

    pub fn cached_issue_body(&self, issue: u32) -> Option<String> {
        fs::read_to_string(self.cache_dir().join(format!("issue-{}.md", issue)))
            .ok()
            .filter(|body| !body.trim().is_empty())
    }

    pub fn cache_issue_body(&self, issue: u32, body: &str) -> Result<(), FleetError> {
        atomic_write(
            &self.cache_dir().join(format!("issue-{}.md", issue)),
            body.as_bytes(),
        )
    }
}
