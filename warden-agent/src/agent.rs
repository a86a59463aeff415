//! Main loop: collect -> decide -> validate -> execute -> record
//!
//! Cycles never overlap. The next one starts `interval - elapsed` after the
//! previous one began (immediately if that is negative). A heartbeat is
//! written after every cycle for the watchdog.

use crate::backend::{HttpBackend, ReasoningBackend};
use crate::config::{Config, ConfigError};
use crate::decision::{CandidateAction, DecisionEngine, DecisionOutcome};
use crate::execution::{ExecutionResult, SandboxedExecutor};
use crate::exit_code;
use crate::heartbeat::{Heartbeat, StateFileError};
use crate::integrity::IntegrityMonitor;
use crate::lifecycle::Lifecycle;
use crate::memory::{
    priority, EntryType, MemoryStore, Payload, PersistenceError, SecurityEvent, SecurityRecord,
};
use crate::metrics::{Collector, MetricSample, MetricsProbe, SysinfoProbe};
use crate::validator::{CommandPolicy, ValidationVerdict};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid command policy: {0}")]
    Policy(#[from] regex::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    StateFile(#[from] StateFileError),
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) | AgentError::Policy(_) => exit_code::CONFIG_INVALID,
            AgentError::Persistence(_) => exit_code::PERSISTENCE_FAILURE,
            AgentError::StateFile(StateFileError::AlreadyRunning { .. }) => exit_code::ALREADY_RUNNING,
            AgentError::StateFile(_) => exit_code::FAILURE,
        }
    }
}

/// What happened in one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub sample: MetricSample,
    pub outcome: DecisionOutcome,
    pub verdict: Option<ValidationVerdict>,
    pub execution: Option<ExecutionResult>,
    pub failure: Option<String>,
}

pub struct Agent {
    config: Config,
    collector: Collector,
    engine: DecisionEngine,
    policy: CommandPolicy,
    executor: SandboxedExecutor,
    memory: MemoryStore,
    integrity: Option<IntegrityMonitor>,
    lifecycle: Lifecycle,
    cycle: u64,
    last_compaction: Instant,
}

impl Agent {
    pub fn new(
        config: Config,
        probe: Box<dyn MetricsProbe>,
        backend: Option<Box<dyn ReasoningBackend>>,
        lifecycle: Lifecycle,
    ) -> Result<Self, AgentError> {
        let memory = MemoryStore::open(&config.agent.memory_log(), config.memory.clone())?;
        let policy = CommandPolicy::from_config(&config.security)?;

        let integrity = match (&config.source_path, config.security.verify_config_integrity) {
            (Some(path), true) => match IntegrityMonitor::new(path) {
                Ok(monitor) => {
                    debug!(path = %path.display(), sha256 = monitor.baseline(), "config baseline recorded");
                    Some(monitor)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot hash config, integrity check disabled");
                    None
                }
            },
            _ => None,
        };

        Ok(Self {
            collector: Collector::new(probe),
            engine: DecisionEngine::new(&config, backend),
            executor: SandboxedExecutor::new(&config.execution, &config.retry),
            policy,
            memory,
            integrity,
            lifecycle,
            cycle: 0,
            last_compaction: Instant::now(),
            config,
        })
    }

    /// Production wiring: sysinfo probe and the HTTP backend when enabled
    pub fn from_config(config: Config, lifecycle: Lifecycle) -> Result<Self, AgentError> {
        let backend: Option<Box<dyn ReasoningBackend>> = if config.backend.enabled {
            Some(Box::new(HttpBackend::new(&config.backend)))
        } else {
            None
        };
        Self::new(config, Box::new(SysinfoProbe::new()), backend, lifecycle)
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Note a supervisor-initiated restart
    pub fn resume(&self, recovery_ref: &str) -> Result<(), AgentError> {
        info!(recovery_ref, "resuming after supervisor restart");
        self.memory.record(
            EntryType::Decision,
            Payload::Resume {
                recovery_ref: recovery_ref.to_string(),
            },
            priority::RESOURCE_ALERT,
        )?;
        Ok(())
    }

    pub async fn run(&mut self) -> Result<(), AgentError> {
        let cancel = self.lifecycle.token();
        let interval = self.config.agent.interval();
        let compaction_every = Duration::from_secs(self.config.memory.compaction_interval_secs);
        self.lifecycle.mark_running();
        info!(interval_secs = interval.as_secs(), "main loop started");

        self.beat();
        while !cancel.is_cancelled() {
            let started = Instant::now();
            let report = self.run_cycle().await?;
            debug!(cycle = report.cycle, outcome = ?report.outcome, "cycle complete");
            self.beat();

            if self.last_compaction.elapsed() >= compaction_every {
                self.memory.compact()?;
                self.last_compaction = Instant::now();
            }

            let wait = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        // Short-term samples are what the next start reads its trends from
        self.memory.compact()?;
        self.lifecycle.mark_stopped();
        info!(cycles = self.cycle, "main loop stopped");
        Ok(())
    }

    fn beat(&self) {
        let beat = Heartbeat::now(self.cycle, self.memory.last_id());
        if let Err(e) = beat.write(&self.config.agent.heartbeat_file()) {
            warn!(error = %e, "failed to write heartbeat");
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, AgentError> {
        self.cycle += 1;
        let cycle = self.cycle;
        let cancel = self.lifecycle.token();
        self.engine.begin_cycle();

        self.check_integrity(cycle)?;

        let sample = self.collector.collect(&self.memory)?;
        let decision = self.engine.decide(cycle, &sample, &self.memory, &cancel).await;
        if decision.is_notable() {
            let priority = if decision.candidate.is_some() {
                priority::RESOURCE_ALERT
            } else if decision.failure.is_some() {
                priority::WARNING
            } else {
                priority::INFO
            };
            self.memory
                .record(EntryType::Decision, Payload::Decision(decision.to_record()), priority)?;
        }

        let mut report = CycleReport {
            cycle,
            sample,
            outcome: decision.outcome,
            verdict: None,
            execution: None,
            failure: decision.failure.clone(),
        };

        let Some(candidate) = decision.candidate.as_ref() else {
            return Ok(report);
        };
        let (verdict, execution) = self.validate_and_execute(candidate, cycle).await?;
        if let Some(Err(e)) = &execution {
            report.failure = Some(e.clone());
        }
        report.execution = execution.and_then(Result::ok);
        report.verdict = Some(verdict);
        Ok(report)
    }

    /// Run one operator command through the same validation and sandbox
    pub async fn exec_once(&mut self, command: &str) -> Result<(ValidationVerdict, Option<ExecutionResult>), AgentError> {
        self.cycle += 1;
        let candidate = CandidateAction::operator(command);
        let (verdict, execution) = self.validate_and_execute(&candidate, self.cycle).await?;
        Ok((verdict, execution.and_then(Result::ok)))
    }

    async fn validate_and_execute(
        &mut self,
        candidate: &CandidateAction,
        cycle: u64,
    ) -> Result<(ValidationVerdict, Option<Result<ExecutionResult, String>>), AgentError> {
        let verdict = self.policy.validate(candidate, cycle);
        let record = SecurityRecord {
            event: if verdict.allowed() {
                SecurityEvent::CommandAllowed
            } else {
                SecurityEvent::CommandRejected
            },
            subject: verdict.sanitized_command().to_string(),
            reason: verdict.reason().to_string(),
            cycle: Some(cycle),
            source: Some(verdict.source()),
            risk_score: Some(verdict.risk_score()),
        };

        if !verdict.allowed() {
            warn!(cycle, command = verdict.sanitized_command(), reason = verdict.reason(), "command rejected");
            self.memory
                .record(EntryType::SecurityEvent, Payload::Security(record), priority::SECURITY)?;
            return Ok((verdict, None));
        }
        self.memory
            .record(EntryType::Decision, Payload::Security(record), priority::RESOURCE_ALERT)?;

        let cancel = self.lifecycle.token();
        if cancel.is_cancelled() {
            return Ok((verdict, None));
        }

        match self.executor.execute(&verdict, cycle, &cancel).await {
            Ok(result) => {
                self.engine.note_execution(&result);
                self.memory.record(
                    EntryType::CommandResult,
                    Payload::Task(result.to_task_record(cycle)),
                    priority::RESOURCE_ALERT,
                )?;
                Ok((verdict, Some(Ok(result))))
            }
            Err(e) => {
                error!(cycle, error = %e, "executor refused an approved verdict");
                self.engine.note_execution_error(verdict.sanitized_command(), &e.to_string());
                Ok((verdict, Some(Err(e.to_string()))))
            }
        }
    }

    fn check_integrity(&mut self, cycle: u64) -> Result<(), AgentError> {
        let Some(violation) = self.integrity.as_mut().and_then(|m| m.check()) else {
            return Ok(());
        };
        self.memory.record(
            EntryType::SecurityEvent,
            Payload::Security(SecurityRecord {
                event: SecurityEvent::IntegrityViolation,
                subject: violation.path.display().to_string(),
                reason: violation.reason(),
                cycle: Some(cycle),
                source: None,
                risk_score: None,
            }),
            priority::SECURITY,
        )?;
        Ok(())
    }
}
