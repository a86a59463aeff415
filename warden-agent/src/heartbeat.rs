//! Liveness files shared with the watchdog
//!
//! - `heartbeat.json`: rewritten every cycle by the main loop
//! - `warden.pid` / `watchdog.pid`: single-instance guards

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::lockfile::FileLock;

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("another instance is already running (pid {pid}, {path})")]
    AlreadyRunning { pid: i32, path: PathBuf },
}

/// Main-loop heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    /// Newest memory entry id at the time of the beat, used as a recovery reference
    pub last_entry_id: Option<u64>,
}

impl Heartbeat {
    pub fn now(cycle: u64, last_entry_id: Option<u64>) -> Self {
        Self {
            pid: std::process::id(),
            cycle,
            timestamp: Utc::now(),
            last_entry_id,
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), StateFileError> {
        write_json_atomic(path, self)
    }

    /// `Ok(None)` when no heartbeat was ever written
    pub fn read(path: &Path) -> Result<Option<Self>, StateFileError> {
        read_json(path)
    }

    pub fn recovery_ref(&self) -> Option<String> {
        self.last_entry_id.map(|id| format!("memory:{id}"))
    }
}

/// Write via a sibling temp file and rename, so readers never see half a file
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateFileError> {
    let io = |source| StateFileError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|source| StateFileError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateFileError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateFileError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StateFileError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

pub fn process_alive(pid: i32) -> bool {
    // Signal 0 only checks existence; EPERM still means the process exists
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Exclusive pid file, removed on drop
///
/// Exclusivity comes from an `flock` held for the guard's lifetime; the pid
/// written inside is informational. A leftover file from a crashed process is
/// unlocked and simply taken over.
#[derive(Debug)]
pub struct PidFile {
    lock: FileLock,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self, StateFileError> {
        let io = |source| StateFileError::Io {
            path: path.to_path_buf(),
            source,
        };
        let Some(mut lock) = FileLock::try_exclusive(path).map_err(io)? else {
            let pid = Self::read_pid(path).unwrap_or(0);
            return Err(StateFileError::AlreadyRunning {
                pid,
                path: path.to_path_buf(),
            });
        };

        if let Some(stale) = Self::read_pid(path) {
            debug!(pid = stale, path = %path.display(), "taking over stale pid file");
        }
        let file = lock.file();
        file.set_len(0).map_err(io)?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        file.write_all(std::process::id().to_string().as_bytes()).map_err(io)?;
        file.sync_data().map_err(io)?;
        Ok(Self { lock })
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    /// Pid recorded in `path`, if the file exists and parses
    pub fn read_pid(path: &Path) -> Option<i32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Removed while still locked; the lock goes with the file handle
        if let Err(e) = std::fs::remove_file(self.lock.path()) {
            warn!(path = %self.lock.path().display(), error = %e, "failed to remove pid file");
        }
    }
}
