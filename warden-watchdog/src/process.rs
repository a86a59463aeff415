//! Real process control for the `warden run` main loop

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use warden_agent::heartbeat::{process_alive, Heartbeat, StateFileError};

use crate::supervisor::{HeartbeatProbe, LaunchError, ProcessController};

/// Launches `<binary> run`, keeping child handles so exits get reaped
pub struct ChildController {
    binary: PathBuf,
    config_path: Option<PathBuf>,
    children: HashMap<i32, Child>,
}

impl ChildController {
    pub fn new(binary: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            binary,
            config_path,
            children: HashMap::new(),
        }
    }

    /// Configured binary, else `warden` next to the running executable
    pub fn resolve_binary(configured: Option<&Path>) -> Result<PathBuf, LaunchError> {
        let candidate = match configured {
            Some(path) => path.to_path_buf(),
            None => std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("warden")))
                .unwrap_or_else(|| PathBuf::from("warden")),
        };
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(LaunchError::BinaryNotFound(candidate))
        }
    }

    fn wait_exit(&mut self, pid: i32, deadline: Instant) -> bool {
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        !self.is_alive(pid)
    }
}

impl ProcessController for ChildController {
    fn launch(&mut self, recovery_ref: Option<&str>) -> Result<i32, LaunchError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run").stdin(Stdio::null());
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        match recovery_ref {
            Some(reference) => cmd.env("WARDEN_RECOVERY_REF", reference),
            None => cmd.env_remove("WARDEN_RECOVERY_REF"),
        };

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        let pid = child.id() as i32;
        debug!(pid, binary = %self.binary.display(), "spawned main loop");
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&mut self, pid: i32) -> bool {
        match self.children.get_mut(&pid) {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid, %status, "main loop exited");
                    self.children.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "cannot query main loop status");
                    process_alive(pid)
                }
            },
            // Adopted from a previous watchdog run
            None => process_alive(pid),
        }
    }

    fn terminate(&mut self, pid: i32, grace: Duration) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM not delivered");
        }
        if self.wait_exit(pid, Instant::now() + grace) {
            return;
        }

        warn!(pid, grace_secs = grace.as_secs(), "main loop ignored SIGTERM, killing");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL not delivered");
        }
        if let Some(mut child) = self.children.remove(&pid) {
            if let Err(e) = child.wait() {
                warn!(pid, error = %e, "failed to reap main loop");
            }
        }
    }
}

/// Reads `heartbeat.json` written by the main loop
pub struct FileHeartbeat {
    path: PathBuf,
}

impl FileHeartbeat {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl HeartbeatProbe for FileHeartbeat {
    fn last_heartbeat(&self) -> Result<Option<Heartbeat>, StateFileError> {
        Heartbeat::read(&self.path)
    }
}
