//! Supervisor checkpoint (`supervisor.json`)
//!
//! The only state the watchdog keeps across its own restarts. Written after
//! every transition so `warden-watchdog status` always shows the latest view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use warden_agent::heartbeat::{read_json, write_json_atomic, StateFileError};

use crate::supervisor::SupervisorPhase;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("supervisor checkpoint: {0}")]
    StateFile(#[from] StateFileError),
}

/// Set when the restart ceiling is hit; only an operator clears it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub at: DateTime<Utc>,
    pub restarts_in_window: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub phase: SupervisorPhase,
    pub pid_of_main_loop: Option<i32>,
    pub last_heartbeat_timestamp: Option<DateTime<Utc>>,
    pub consecutive_failure_count: u32,
    pub recovery_checkpoint_ref: Option<String>,
    /// Restart times inside the sliding failure window
    #[serde(default)]
    pub restart_history: Vec<DateTime<Utc>>,
    pub escalation: Option<Escalation>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            phase: SupervisorPhase::Starting,
            pid_of_main_loop: None,
            last_heartbeat_timestamp: None,
            consecutive_failure_count: 0,
            recovery_checkpoint_ref: None,
            restart_history: Vec::new(),
            escalation: None,
            updated_at: Utc::now(),
        }
    }
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh state when no checkpoint exists yet
    pub fn load(&self) -> Result<SupervisorState, CheckpointError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, state: &SupervisorState) -> Result<(), CheckpointError> {
        write_json_atomic(&self.path, state)?;
        Ok(())
    }

    /// Operator reset: clear escalation, restart history and the failure streak.
    /// The recovery reference and last known pid are kept.
    pub fn reset(&self) -> Result<SupervisorState, CheckpointError> {
        let mut state = self.load()?;
        if let Some(escalation) = &state.escalation {
            info!(since = %escalation.at, "clearing supervisor escalation");
        }
        state.escalation = None;
        state.restart_history.clear();
        state.consecutive_failure_count = 0;
        state.phase = SupervisorPhase::Starting;
        state.updated_at = Utc::now();
        self.save(&state)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_checkpoint_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(&dir.path().join("supervisor.json"));
        let state = store.load().unwrap();
        assert_eq!(state.phase, SupervisorPhase::Starting);
        assert!(state.escalation.is_none());
        assert!(state.restart_history.is_empty());
    }

    #[test]
    fn test_reset_clears_escalation_but_keeps_recovery_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(&dir.path().join("supervisor.json"));
        let now = Utc::now();
        let state = SupervisorState {
            phase: SupervisorPhase::Terminated,
            pid_of_main_loop: Some(4321),
            consecutive_failure_count: 6,
            recovery_checkpoint_ref: Some("memory:99".into()),
            restart_history: vec![now, now],
            escalation: Some(Escalation {
                at: now,
                restarts_in_window: 5,
                reason: "restart ceiling reached".into(),
            }),
            ..Default::default()
        };
        store.save(&state).unwrap();

        let reset = store.reset().unwrap();
        assert!(reset.escalation.is_none());
        assert!(reset.restart_history.is_empty());
        assert_eq!(reset.consecutive_failure_count, 0);
        assert_eq!(reset.recovery_checkpoint_ref.as_deref(), Some("memory:99"));
        assert_eq!(store.load().unwrap(), reset);
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(CheckpointStore::new(&path).load().is_err());
    }
}
