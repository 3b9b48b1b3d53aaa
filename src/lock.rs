//! One monitor per fleet.
//!
//! The monitor holds an `fslock` lock on `monitor.lock` in the fleet's state
//! directory for as long as it drives workers. Who holds it is recorded next
//! to the lock in `monitor.json`, so a refused monitor can say which process
//! owns the fleet and since when.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::log_warn;
use crate::store::{write_json, StateStore};

pub const LOCK_FILE: &str = "monitor.lock";
pub const HOLDER_FILE: &str = "monitor.json";

/// The monitor process that owns a fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub fleet: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    /// Read the holder record in `state_dir`. Missing or malformed reads as absent.
    pub fn read(state_dir: &Path) -> Option<LockHolder> {
        let text = fs::read_to_string(state_dir.join(HOLDER_FILE)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn is_alive(&self) -> bool {
        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        // signal 0 only checks that the process exists
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
}

/// Exclusive hold on a fleet's state directory. Released on drop.
#[must_use = "the fleet is unlocked as soon as MonitorLock is dropped"]
pub struct MonitorLock {
    lock: fslock::LockFile,
    holder_path: PathBuf,
    pub holder: LockHolder,
}

impl std::fmt::Debug for MonitorLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorLock")
            .field("holder", &self.holder)
            .field("holder_path", &self.holder_path)
            .finish()
    }
}

impl Drop for MonitorLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.holder_path) {
            log_warn!(
                "[lock] Failed to remove {}: {}",
                self.holder_path.display(),
                e
            );
        }
        if let Err(e) = self.lock.unlock() {
            log_warn!("[lock] Failed to unlock fleet '{}': {}", self.holder.fleet, e);
        }
    }
}

/// Take the monitor lock for the fleet behind `store`.
///
/// Fails with a message naming the fleet, its state directory and, when the
/// holder record is readable, the PID that owns it.
pub fn try_acquire(store: &StateStore) -> Result<MonitorLock, String> {
    let state_dir = &store.state_dir;
    let fleet = &store.namespace;
    fs::create_dir_all(state_dir)
        .map_err(|e| format!("Failed to create {}: {}", state_dir.display(), e))?;

    let lock_path = state_dir.join(LOCK_FILE);
    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;
    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to lock fleet '{}': {}", fleet, e))?;

    if !acquired {
        return Err(refusal(fleet, state_dir, &lock_path));
    }

    let holder = LockHolder {
        fleet: fleet.clone(),
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let holder_path = state_dir.join(HOLDER_FILE);
    write_json(&holder_path, &holder).map_err(String::from)?;

    Ok(MonitorLock {
        lock,
        holder_path,
        holder,
    })
}

fn refusal(fleet: &str, state_dir: &Path, lock_path: &Path) -> String {
    match LockHolder::read(state_dir) {
        Some(holder) if holder.is_alive() => format!(
            "Fleet '{}' is already driven by wavecrew monitor PID {} (since {}); state directory {}",
            fleet,
            holder.pid,
            holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            state_dir.display()
        ),
        Some(holder) => format!(
            "Fleet '{}' is locked by PID {}, which is no longer running. \
             Remove {} and {} to recover",
            fleet,
            holder.pid,
            lock_path.display(),
            state_dir.join(HOLDER_FILE).display()
        ),
        None => format!(
            "Fleet '{}' is locked by another wavecrew monitor; state directory {}",
            fleet,
            state_dir.display()
        ),
    }
}
