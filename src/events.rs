use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::NamedTempFile;

use crate::error::FleetError;
use crate::pipeline::RetryStep;
use crate::types::Decision;

/// Append-only JSON-lines audit trail of what the monitor did.
///
/// Each line is `{"timestamp": "<UTC>", "event": {...}}`. Nothing reads it
/// back for decisions.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event.
    ///
    /// The existing log is copied into a temporary file together with the new
    /// line and renamed over the original, so a reader never sees half a line.
    pub fn append(&self, event: serde_json::Value) -> Result<(), FleetError> {
        let write_err = |source| FleetError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_err)?;

        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let line = json!({ "timestamp": timestamp, "event": event });

        let mut temp_file = NamedTempFile::new_in(parent).map_err(write_err)?;
        match fs::File::open(&self.path) {
            Ok(mut existing) => {
                std::io::copy(&mut existing, temp_file.as_file_mut()).map_err(write_err)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_err(e)),
        }
        writeln!(temp_file, "{}", line).map_err(write_err)?;
        temp_file.as_file().sync_all().map_err(write_err)?;
        temp_file.persist(&self.path).map_err(|e| write_err(e.error))?;

        Ok(())
    }

    pub fn record_decision(
        &self,
        decision: &Decision,
        outcome: &Result<(), String>,
    ) -> Result<(), FleetError> {
        let mut event = json!({
            "type": "decision",
            "action": decision.action,
            "worker": decision.worker_id,
            "issue": decision.issue_number,
            "new_issue": decision.new_issue,
            "reason": decision.reason,
            "continuation": decision.continuation,
            "source_config": decision.source_config,
        });
        if let Err(e) = outcome {
            event["error"] = json!(e);
        }
        self.append(event)
    }

    pub fn record_retry_step(
        &self,
        worker_id: u32,
        issue: Option<u32>,
        step: RetryStep,
    ) -> Result<(), FleetError> {
        self.append(json!({
            "type": "retry_step",
            "worker": worker_id,
            "issue": issue,
            "step": step.to_string(),
            "timed_out": step.timed_out(),
        }))
    }

    pub fn record_signal_recovery(&self, worker_id: u32, code: i32) -> Result<(), FleetError> {
        self.append(json!({
            "type": "signal_recovered",
            "worker": worker_id,
            "exit_code": code,
        }))
    }

    pub fn record_cycle(&self, cycle: u64, summary: &str) -> Result<(), FleetError> {
        self.append(json!({
            "type": "cycle",
            "cycle": cycle,
            "summary": summary,
        }))
    }
}
