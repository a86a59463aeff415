//! Supervisor state machine
//!
//! ```text
//! STARTING → RUNNING → (HEALTHY | UNRESPONSIVE) → RESTARTING → RUNNING | TERMINATED
//! ```
//!
//! Each poll checks process liveness and heartbeat freshness. Consecutive
//! misses trigger a restart; too many restarts inside the failure window
//! escalate and stop all automatic restarts until an operator resets.
//! Time is passed in by the caller.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use warden_agent::config::SupervisorConfig;
use warden_agent::heartbeat::{Heartbeat, StateFileError};

use crate::checkpoint::{CheckpointError, CheckpointStore, Escalation, SupervisorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Starting,
    Running,
    Healthy,
    Unresponsive,
    Restarting,
    Terminated,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("main loop binary not found: {0}")]
    BinaryNotFound(std::path::PathBuf),
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: std::path::PathBuf,
        source: std::io::Error,
    },
}

/// Starts and stops the main loop process
pub trait ProcessController: Send {
    fn launch(&mut self, recovery_ref: Option<&str>) -> Result<i32, LaunchError>;
    fn is_alive(&mut self, pid: i32) -> bool;
    /// Polite stop, then forced after `grace`
    fn terminate(&mut self, pid: i32, grace: std::time::Duration);
}

pub trait HeartbeatProbe: Send {
    fn last_heartbeat(&self) -> Result<Option<Heartbeat>, StateFileError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Healthy,
    Missed(u32),
    Restarted { pid: i32 },
    LaunchFailed,
    Escalated,
    Terminated,
}

pub struct Supervisor<C, H> {
    config: SupervisorConfig,
    controller: C,
    heartbeat: H,
    checkpoint: CheckpointStore,
    state: SupervisorState,
    missed: u32,
    launched_at: Option<DateTime<Utc>>,
}

impl<C: ProcessController, H: HeartbeatProbe> Supervisor<C, H> {
    pub fn new(
        config: SupervisorConfig,
        controller: C,
        heartbeat: H,
        checkpoint: CheckpointStore,
    ) -> Result<Self, CheckpointError> {
        let state = checkpoint.load()?;
        Ok(Self {
            config,
            controller,
            heartbeat,
            checkpoint,
            state,
            missed: 0,
            launched_at: None,
        })
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.state.phase
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Adopt a main loop recorded in the checkpoint if it is still alive, else launch one
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<PollOutcome, CheckpointError> {
        if let Some(escalation) = &self.state.escalation {
            error!(
                since = %escalation.at,
                reason = %escalation.reason,
                "escalation pending, run `warden-watchdog reset` to resume supervision"
            );
            self.state.phase = SupervisorPhase::Terminated;
            self.persist(now)?;
            return Ok(PollOutcome::Escalated);
        }

        self.state.phase = SupervisorPhase::Starting;
        if let Some(pid) = self.state.pid_of_main_loop {
            if self.controller.is_alive(pid) {
                info!(pid, "adopting running main loop");
                self.launched_at = Some(now);
                self.state.phase = SupervisorPhase::Running;
                self.persist(now)?;
                return Ok(PollOutcome::Healthy);
            }
        }

        let recovery_ref = self.state.recovery_checkpoint_ref.clone();
        match self.controller.launch(recovery_ref.as_deref()) {
            Ok(pid) => {
                info!(pid, "main loop launched");
                self.state.pid_of_main_loop = Some(pid);
                self.launched_at = Some(now);
                self.state.phase = SupervisorPhase::Running;
                self.persist(now)?;
                Ok(PollOutcome::Restarted { pid })
            }
            Err(e) => {
                error!(error = %e, "failed to launch main loop");
                self.state.pid_of_main_loop = None;
                self.state.phase = SupervisorPhase::Unresponsive;
                self.persist(now)?;
                Ok(PollOutcome::LaunchFailed)
            }
        }
    }

    pub fn poll(&mut self, now: DateTime<Utc>) -> Result<PollOutcome, CheckpointError> {
        if self.state.phase == SupervisorPhase::Terminated {
            return Ok(PollOutcome::Terminated);
        }

        let pid = self.state.pid_of_main_loop;
        let alive = pid.map_or(false, |pid| self.controller.is_alive(pid));
        let beat = match self.heartbeat.last_heartbeat() {
            Ok(beat) => beat,
            Err(e) => {
                warn!(error = %e, "unreadable heartbeat, treating as missing");
                None
            }
        };

        if let Some(beat) = &beat {
            self.state.last_heartbeat_timestamp = Some(beat.timestamp);
            if let Some(recovery_ref) = beat.recovery_ref() {
                self.state.recovery_checkpoint_ref = Some(recovery_ref);
            }
        }

        // A freshly launched process gets one staleness window before its first beat
        let freshest = beat.as_ref().map(|b| b.timestamp).max(self.launched_at);
        let fresh = freshest.map_or(false, |t| now - t <= Duration::seconds(self.config.staleness_secs));

        if alive && fresh {
            self.missed = 0;
            self.state.phase = SupervisorPhase::Healthy;
            // The relaunched process proved itself once it beats after launch
            let proven = beat
                .as_ref()
                .map_or(false, |b| Some(b.pid as i32) == pid && Some(b.timestamp) > self.launched_at);
            if proven && self.state.consecutive_failure_count > 0 {
                info!(
                    failures = self.state.consecutive_failure_count,
                    "main loop recovered"
                );
                self.state.consecutive_failure_count = 0;
            }
            self.persist(now)?;
            return Ok(PollOutcome::Healthy);
        }

        self.missed += 1;
        self.state.phase = SupervisorPhase::Unresponsive;
        warn!(
            pid = ?pid,
            alive,
            fresh,
            missed = self.missed,
            "main loop liveness check missed"
        );

        if self.missed < self.config.missed_heartbeats_before_restart {
            self.persist(now)?;
            return Ok(PollOutcome::Missed(self.missed));
        }
        self.restart(now)
    }

    fn restart(&mut self, now: DateTime<Utc>) -> Result<PollOutcome, CheckpointError> {
        self.state.phase = SupervisorPhase::Restarting;
        self.missed = 0;

        let window_start = now - Duration::seconds(self.config.failure_window_secs);
        self.state.restart_history.retain(|t| *t > window_start);

        if let Some(pid) = self.state.pid_of_main_loop {
            if self.controller.is_alive(pid) {
                info!(pid, "terminating unresponsive main loop");
                self.controller
                    .terminate(pid, std::time::Duration::from_secs(self.config.termination_grace_secs));
            }
        }
        self.state.pid_of_main_loop = None;

        let restarts = self.state.restart_history.len() as u32;
        if restarts >= self.config.failure_ceiling {
            error!(
                restarts,
                window_secs = self.config.failure_window_secs,
                "restart ceiling reached, escalating to operator"
            );
            self.state.escalation = Some(Escalation {
                at: now,
                restarts_in_window: restarts,
                reason: format!(
                    "{restarts} restarts within {}s, ceiling is {}",
                    self.config.failure_window_secs, self.config.failure_ceiling
                ),
            });
            self.state.phase = SupervisorPhase::Terminated;
            self.persist(now)?;
            return Ok(PollOutcome::Escalated);
        }

        // Prefer the checkpoint on disk; it holds the last recovery ref any supervisor saw
        let recovery_ref = self
            .checkpoint
            .load()?
            .recovery_checkpoint_ref
            .or_else(|| self.state.recovery_checkpoint_ref.clone());

        self.state.restart_history.push(now);
        self.state.consecutive_failure_count += 1;

        let outcome = match self.controller.launch(recovery_ref.as_deref()) {
            Ok(pid) => {
                info!(
                    pid,
                    recovery_ref = ?recovery_ref,
                    failures = self.state.consecutive_failure_count,
                    "main loop restarted"
                );
                self.state.pid_of_main_loop = Some(pid);
                self.state.recovery_checkpoint_ref = recovery_ref;
                self.state.phase = SupervisorPhase::Running;
                self.launched_at = Some(now);
                PollOutcome::Restarted { pid }
            }
            Err(e) => {
                error!(error = %e, "failed to relaunch main loop");
                self.state.phase = SupervisorPhase::Unresponsive;
                self.launched_at = None;
                PollOutcome::LaunchFailed
            }
        };
        self.persist(now)?;
        Ok(outcome)
    }

    fn persist(&mut self, now: DateTime<Utc>) -> Result<(), CheckpointError> {
        self.state.updated_at = now;
        self.checkpoint.save(&self.state)?;
        debug!(phase = ?self.state.phase, "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Processes {
        next_pid: i32,
        alive: HashSet<i32>,
        launches: Vec<Option<String>>,
        terminated: Vec<i32>,
        fail_launch: bool,
    }

    #[derive(Clone, Default)]
    struct FakeController(Arc<Mutex<Processes>>);

    impl FakeController {
        fn kill(&self, pid: i32) {
            self.0.lock().unwrap().alive.remove(&pid);
        }

        fn launches(&self) -> Vec<Option<String>> {
            self.0.lock().unwrap().launches.clone()
        }

        fn terminated(&self) -> Vec<i32> {
            self.0.lock().unwrap().terminated.clone()
        }
    }

    impl ProcessController for FakeController {
        fn launch(&mut self, recovery_ref: Option<&str>) -> Result<i32, LaunchError> {
            let mut p = self.0.lock().unwrap();
            p.launches.push(recovery_ref.map(str::to_string));
            if p.fail_launch {
                return Err(LaunchError::BinaryNotFound("/nonexistent/warden".into()));
            }
            p.next_pid += 1;
            let pid = 1000 + p.next_pid;
            p.alive.insert(pid);
            Ok(pid)
        }

        fn is_alive(&mut self, pid: i32) -> bool {
            self.0.lock().unwrap().alive.contains(&pid)
        }

        fn terminate(&mut self, pid: i32, _grace: std::time::Duration) {
            let mut p = self.0.lock().unwrap();
            p.alive.remove(&pid);
            p.terminated.push(pid);
        }
    }

    #[derive(Clone, Default)]
    struct FakeHeartbeat(Arc<Mutex<Option<Heartbeat>>>);

    impl FakeHeartbeat {
        fn beat(&self, pid: i32, at: DateTime<Utc>, last_entry_id: u64) {
            *self.0.lock().unwrap() = Some(Heartbeat {
                pid: pid as u32,
                cycle: 1,
                timestamp: at,
                last_entry_id: Some(last_entry_id),
            });
        }
    }

    impl HeartbeatProbe for FakeHeartbeat {
        fn last_heartbeat(&self) -> Result<Option<Heartbeat>, StateFileError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn config(ceiling: u32) -> SupervisorConfig {
        SupervisorConfig {
            staleness_secs: 60,
            missed_heartbeats_before_restart: 2,
            failure_ceiling: ceiling,
            failure_window_secs: 3600,
            ..SupervisorConfig::default()
        }
    }

    fn supervisor(
        dir: &TempDir,
        ceiling: u32,
    ) -> (Supervisor<FakeController, FakeHeartbeat>, FakeController, FakeHeartbeat) {
        let controller = FakeController::default();
        let heartbeat = FakeHeartbeat::default();
        let checkpoint = CheckpointStore::new(&dir.path().join("supervisor.json"));
        let sup = Supervisor::new(config(ceiling), controller.clone(), heartbeat.clone(), checkpoint).unwrap();
        (sup, controller, heartbeat)
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    #[test]
    fn test_start_launches_and_stays_healthy_while_beating() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, heartbeat) = supervisor(&dir, 5);
        let t0 = Utc::now();

        assert_eq!(sup.start(t0).unwrap(), PollOutcome::Restarted { pid: 1001 });
        assert_eq!(sup.phase(), SupervisorPhase::Running);

        // No beat yet, but inside the launch grace window
        assert_eq!(sup.poll(t0 + secs(10)).unwrap(), PollOutcome::Healthy);

        heartbeat.beat(1001, t0 + secs(50), 7);
        assert_eq!(sup.poll(t0 + secs(100)).unwrap(), PollOutcome::Healthy);
        assert_eq!(sup.phase(), SupervisorPhase::Healthy);
        assert_eq!(sup.state().recovery_checkpoint_ref.as_deref(), Some("memory:7"));
        assert_eq!(controller.launches().len(), 1);
    }

    #[test]
    fn test_dead_process_restarts_after_two_misses_with_recovery_ref() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, heartbeat) = supervisor(&dir, 5);
        let t0 = Utc::now();
        sup.start(t0).unwrap();
        heartbeat.beat(1001, t0 + secs(5), 42);
        controller.kill(1001);

        assert_eq!(sup.poll(t0 + secs(10)).unwrap(), PollOutcome::Missed(1));
        assert_eq!(sup.phase(), SupervisorPhase::Unresponsive);
        assert_eq!(sup.poll(t0 + secs(20)).unwrap(), PollOutcome::Restarted { pid: 1002 });

        assert_eq!(controller.launches(), vec![None, Some("memory:42".to_string())]);
        // Already dead, nothing to terminate
        assert!(controller.terminated().is_empty());
        assert_eq!(sup.state().consecutive_failure_count, 1);
        assert_eq!(sup.state().pid_of_main_loop, Some(1002));
    }

    #[test]
    fn test_stale_heartbeat_terminates_leftover_process() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, heartbeat) = supervisor(&dir, 5);
        let t0 = Utc::now();
        sup.start(t0).unwrap();
        heartbeat.beat(1001, t0 + secs(5), 3);

        // Alive but silent for longer than the staleness window
        assert_eq!(sup.poll(t0 + secs(100)).unwrap(), PollOutcome::Missed(1));
        assert_eq!(sup.poll(t0 + secs(110)).unwrap(), PollOutcome::Restarted { pid: 1002 });
        assert_eq!(controller.terminated(), vec![1001]);
    }

    #[test]
    fn test_single_miss_then_recovery_does_not_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, heartbeat) = supervisor(&dir, 5);
        let t0 = Utc::now();
        sup.start(t0).unwrap();

        assert_eq!(sup.poll(t0 + secs(100)).unwrap(), PollOutcome::Missed(1));
        heartbeat.beat(1001, t0 + secs(105), 1);
        assert_eq!(sup.poll(t0 + secs(110)).unwrap(), PollOutcome::Healthy);
        // The miss counter starts over
        assert_eq!(sup.poll(t0 + secs(200)).unwrap(), PollOutcome::Missed(1));
        assert_eq!(controller.launches().len(), 1);
    }

    #[test]
    fn test_failure_count_clears_once_relaunched_process_beats() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, heartbeat) = supervisor(&dir, 5);
        let t0 = Utc::now();
        sup.start(t0).unwrap();
        controller.kill(1001);
        sup.poll(t0 + secs(10)).unwrap();
        sup.poll(t0 + secs(20)).unwrap();
        assert_eq!(sup.state().consecutive_failure_count, 1);

        // Healthy on launch grace alone does not clear the streak
        sup.poll(t0 + secs(30)).unwrap();
        assert_eq!(sup.state().consecutive_failure_count, 1);

        heartbeat.beat(1002, t0 + secs(35), 9);
        sup.poll(t0 + secs(40)).unwrap();
        assert_eq!(sup.state().consecutive_failure_count, 0);
    }

    #[test]
    fn test_restart_storm_escalates_and_stays_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, _heartbeat) = supervisor(&dir, 2);
        let t0 = Utc::now();
        sup.start(t0).unwrap();

        let mut t = t0;
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let pid = sup.state().pid_of_main_loop.unwrap();
            controller.kill(pid);
            t = t + secs(10);
            sup.poll(t).unwrap();
            t = t + secs(10);
            outcomes.push(sup.poll(t).unwrap());
        }

        assert!(matches!(outcomes[0], PollOutcome::Restarted { .. }));
        assert!(matches!(outcomes[1], PollOutcome::Restarted { .. }));
        assert_eq!(outcomes[2], PollOutcome::Escalated);
        assert_eq!(sup.phase(), SupervisorPhase::Terminated);
        assert_eq!(sup.poll(t + secs(10)).unwrap(), PollOutcome::Terminated);
        assert_eq!(controller.launches().len(), 3);

        // Escalation survives a watchdog restart
        let checkpoint = CheckpointStore::new(&dir.path().join("supervisor.json"));
        let persisted = checkpoint.load().unwrap();
        assert_eq!(persisted.escalation.as_ref().unwrap().restarts_in_window, 2);

        let mut again = Supervisor::new(config(2), controller.clone(), FakeHeartbeat::default(), checkpoint).unwrap();
        assert_eq!(again.start(t + secs(20)).unwrap(), PollOutcome::Escalated);
        assert_eq!(controller.launches().len(), 3);
    }

    #[test]
    fn test_restarts_outside_window_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FakeController::default();
        let checkpoint = CheckpointStore::new(&dir.path().join("supervisor.json"));
        let cfg = SupervisorConfig {
            failure_ceiling: 1,
            failure_window_secs: 100,
            ..config(1)
        };
        let mut sup = Supervisor::new(cfg, controller.clone(), FakeHeartbeat::default(), checkpoint).unwrap();
        let t0 = Utc::now();
        sup.start(t0).unwrap();

        controller.kill(1001);
        sup.poll(t0 + secs(10)).unwrap();
        assert!(matches!(sup.poll(t0 + secs(20)).unwrap(), PollOutcome::Restarted { .. }));

        controller.kill(1002);
        sup.poll(t0 + secs(200)).unwrap();
        assert!(matches!(sup.poll(t0 + secs(210)).unwrap(), PollOutcome::Restarted { .. }));
    }

    #[test]
    fn test_start_adopts_live_process_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, _heartbeat) = supervisor(&dir, 5);
        let t0 = Utc::now();
        sup.start(t0).unwrap();
        drop(sup);

        let checkpoint = CheckpointStore::new(&dir.path().join("supervisor.json"));
        let mut sup = Supervisor::new(config(5), controller.clone(), FakeHeartbeat::default(), checkpoint).unwrap();
        assert_eq!(sup.start(t0 + secs(5)).unwrap(), PollOutcome::Healthy);
        assert_eq!(controller.launches().len(), 1);
    }

    #[test]
    fn test_failed_launch_counts_toward_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, controller, _heartbeat) = supervisor(&dir, 1);
        let t0 = Utc::now();
        controller.0.lock().unwrap().fail_launch = true;

        assert_eq!(sup.start(t0).unwrap(), PollOutcome::LaunchFailed);
        sup.poll(t0 + secs(10)).unwrap();
        assert_eq!(sup.poll(t0 + secs(20)).unwrap(), PollOutcome::LaunchFailed);
        sup.poll(t0 + secs(30)).unwrap();
        assert_eq!(sup.poll(t0 + secs(40)).unwrap(), PollOutcome::Escalated);
    }
}
