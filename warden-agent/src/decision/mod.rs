//! Decision engine
//!
//! One pass per cycle: `Collecting -> Evaluating -> ThresholdTriggered |
//! BackendConsult | NoAction`. Rule ceilings are checked first and suppress
//! the backend. Without a breach, a sustained trend or a statistical anomaly
//! asks the reasoning backend for a suggestion. At most one candidate per cycle.
//!
//! History is read back from the memory store every cycle, so a trend that
//! started before a restart is still seen once the store has been reopened.

mod trend;

pub use trend::{History, Signal, SignalKind};

use crate::backend::{parse_candidate, ReasoningBackend};
use crate::config::{Config, DecisionConfig, Resource, ThresholdConfig};
use crate::execution::ExecutionResult;
use crate::memory::{DecisionRecord, EntryType, MemoryEntry, MemoryQuery, MemoryStore, Payload};
use crate::metrics::MetricSample;
use crate::retry::{RetryError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    RuleBased,
    ReasoningBackend,
    Operator,
}

/// A proposed remediation, not yet validated
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAction {
    pub source: CandidateSource,
    pub command: String,
    pub rationale: String,
    pub risk_score: f64,
}

impl CandidateAction {
    pub fn operator(command: &str) -> Self {
        Self {
            source: CandidateSource::Operator,
            command: command.to_string(),
            rationale: "operator request".to_string(),
            risk_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Collecting,
    Evaluating,
    ThresholdTriggered,
    BackendConsult,
    NoAction,
}

/// Terminal phase of a cycle, as recorded in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    ThresholdTriggered,
    BackendConsult,
    NoAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub cycle: u64,
    pub outcome: DecisionOutcome,
    pub trigger: Option<String>,
    pub candidate: Option<CandidateAction>,
    pub failure: Option<String>,
}

impl Decision {
    fn no_action(cycle: u64, trigger: Option<String>, failure: Option<String>) -> Self {
        Self {
            cycle,
            outcome: DecisionOutcome::NoAction,
            trigger,
            candidate: None,
            failure,
        }
    }

    /// Worth a memory entry: anything but a quiet cycle
    pub fn is_notable(&self) -> bool {
        self.outcome != DecisionOutcome::NoAction || self.trigger.is_some() || self.failure.is_some()
    }

    pub fn to_record(&self) -> DecisionRecord {
        DecisionRecord {
            cycle: self.cycle,
            outcome: self.outcome,
            trigger: self.trigger.clone(),
            source: self.candidate.as_ref().map(|c| c.source),
            command: self.candidate.as_ref().map(|c| c.command.clone()),
            rationale: self.candidate.as_ref().map(|c| c.rationale.clone()),
            risk_score: self.candidate.as_ref().map(|c| c.risk_score),
            failure: self.failure.clone(),
        }
    }
}

/// Fixed read-only diagnostic per breached resource
pub fn remediation(resource: Resource) -> &'static str {
    match resource {
        Resource::Disk => "df -h",
        Resource::Memory => "ps aux --sort=-%mem",
        Resource::Cpu => "ps aux --sort=-%cpu",
        Resource::Network => "ss -s",
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub resource: Resource,
    pub value: f64,
    pub threshold: f64,
}

impl Breach {
    /// Proportional to the overshoot, within [0, 0.5]
    pub fn risk_score(&self) -> f64 {
        let span = match self.resource {
            Resource::Network => self.threshold,
            _ => 100.0 - self.threshold,
        };
        if span <= 0.0 {
            return 0.5;
        }
        (0.5 * (self.value - self.threshold) / span).clamp(0.0, 0.5)
    }
}

/// Breached ceilings in the configured priority order
pub fn breaches(sample: &MetricSample, thresholds: &ThresholdConfig, order: &[Resource]) -> Vec<Breach> {
    order
        .iter()
        .filter_map(|&resource| {
            let threshold = match resource {
                Resource::Cpu => f64::from(thresholds.cpu_percent),
                Resource::Memory => f64::from(thresholds.memory_percent),
                Resource::Disk => f64::from(thresholds.disk_percent),
                Resource::Network => f64::from(thresholds.network_connections),
            };
            let value = trend::reading(sample, resource)?;
            (value > threshold).then_some(Breach {
                resource,
                value,
                threshold,
            })
        })
        .collect()
}

pub struct DecisionEngine {
    thresholds: ThresholdConfig,
    config: DecisionConfig,
    backend: Option<Box<dyn ReasoningBackend>>,
    backend_timeout: Duration,
    retry: RetryPolicy,
    history_len: usize,
    last_failure: Option<String>,
    cooldown_until: Option<Instant>,
    phase: CyclePhase,
}

impl DecisionEngine {
    pub fn new(config: &Config, backend: Option<Box<dyn ReasoningBackend>>) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            config: config.decision.clone(),
            backend,
            backend_timeout: Duration::from_secs(config.backend.timeout_secs),
            retry: RetryPolicy::from_config(&config.retry),
            history_len: config.decision.anomaly_window.max(config.decision.trend_window),
            last_failure: None,
            cooldown_until: None,
            phase: CyclePhase::Collecting,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn begin_cycle(&mut self) {
        self.phase = CyclePhase::Collecting;
    }

    fn transition(&mut self, next: CyclePhase) {
        debug!(from = ?self.phase, to = ?next, "decision phase");
        self.phase = next;
    }

    /// Keep the outcome of the last executed command for the next prompt
    pub fn note_execution(&mut self, result: &ExecutionResult) {
        self.last_failure = (!result.success()).then(|| {
            let detail = result.stderr.lines().next().unwrap_or("").trim();
            let mut line = format!(
                "{} finished {:?} (exit {})",
                result.command,
                result.status,
                fmt_opt(result.exit_code)
            );
            if !detail.is_empty() {
                line.push_str(": ");
                line.push_str(detail);
            }
            truncate_at(&mut line, MAX_FAILURE_CHARS);
            line
        });
    }

    pub fn note_execution_error(&mut self, command: &str, error: &str) {
        let mut line = format!("{command} was not run: {error}");
        truncate_at(&mut line, MAX_FAILURE_CHARS);
        self.last_failure = Some(line);
    }

    pub async fn decide(
        &mut self,
        cycle: u64,
        sample: &MetricSample,
        memory: &MemoryStore,
        cancel: &CancellationToken,
    ) -> Decision {
        self.transition(CyclePhase::Evaluating);
        // Only the cycle right after a failed command hears about it
        let previous_failure = self.last_failure.take();
        let decision = self
            .evaluate(cycle, sample, memory, previous_failure.as_deref(), cancel)
            .await;

        self.transition(match decision.outcome {
            DecisionOutcome::ThresholdTriggered => CyclePhase::ThresholdTriggered,
            DecisionOutcome::BackendConsult => CyclePhase::BackendConsult,
            DecisionOutcome::NoAction => CyclePhase::NoAction,
        });
        decision
    }

    async fn evaluate(
        &mut self,
        cycle: u64,
        sample: &MetricSample,
        memory: &MemoryStore,
        previous_failure: Option<&str>,
        cancel: &CancellationToken,
    ) -> Decision {
        let found = breaches(sample, &self.thresholds, &self.config.priority_order);
        if let Some(breach) = found.first() {
            if found.len() > 1 {
                debug!(
                    suppressed = ?found[1..].iter().map(|b| b.resource).collect::<Vec<_>>(),
                    "lower-priority breaches deferred"
                );
            }
            info!(
                resource = %breach.resource,
                value = breach.value,
                threshold = breach.threshold,
                "threshold breached"
            );
            return Decision {
                cycle,
                outcome: DecisionOutcome::ThresholdTriggered,
                trigger: Some(format!(
                    "{} at {:.1} above {:.1}",
                    breach.resource, breach.value, breach.threshold
                )),
                candidate: Some(CandidateAction {
                    source: CandidateSource::RuleBased,
                    command: remediation(breach.resource).to_string(),
                    rationale: format!("{} usage over its ceiling", breach.resource),
                    risk_score: breach.risk_score(),
                }),
                failure: None,
            };
        }

        let history = recall_history(memory, sample, self.history_len);
        let Some(signal) = history.detect(sample, &self.config) else {
            return Decision::no_action(cycle, None, None);
        };
        let trigger = Some(signal.to_string());
        info!(signal = %signal, "consulting reasoning backend");

        let Some(backend) = self.backend.as_deref() else {
            return Decision::no_action(cycle, trigger, Some("reasoning backend disabled".into()));
        };
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return Decision::no_action(cycle, trigger, Some("backend cooling down".into()));
            }
            self.cooldown_until = None;
        }

        let context = PromptContext {
            history: &history,
            events: &recent_events(memory, RECENT_EVENTS),
            last_failure: previous_failure,
        };
        let prompt = build_prompt(&signal, sample, &context, self.config.max_prompt_chars);
        let timeout = self.backend_timeout;
        let result = self
            .retry
            .run("backend consult", cancel, || backend.complete(&prompt, timeout))
            .await;

        let completion = match result {
            Ok(completion) => completion,
            Err(RetryError::Cancelled { .. }) => {
                return Decision::no_action(cycle, trigger, Some("backend consult cancelled".into()));
            }
            Err(e) => {
                warn!(error = %e, cooldown_secs = self.config.backend_cooldown_secs, "backend unavailable, cooling down");
                self.cooldown_until = Some(Instant::now() + Duration::from_secs(self.config.backend_cooldown_secs));
                return Decision::no_action(cycle, trigger, Some(e.to_string()));
            }
        };

        match parse_candidate(&completion) {
            Ok(Some(candidate)) => Decision {
                cycle,
                outcome: DecisionOutcome::BackendConsult,
                trigger,
                candidate: Some(candidate),
                failure: None,
            },
            Ok(None) => Decision::no_action(cycle, trigger, None),
            Err(e) => {
                warn!(error = %e, "discarding backend completion");
                Decision::no_action(cycle, trigger, Some(e.to_string()))
            }
        }
    }
}

const RECENT_EVENTS: usize = 5;
const MAX_FAILURE_CHARS: usize = 240;

/// Recorded samples, oldest first, without `current` itself
fn recall_history(memory: &MemoryStore, current: &MetricSample, capacity: usize) -> History {
    let query = MemoryQuery {
        limit: Some(capacity + 1),
        ..MemoryQuery::of_type(EntryType::Metric)
    };
    let mut history = History::new(capacity);
    for entry in memory.query(&query).into_iter().rev() {
        if let Payload::Metrics(sample) = entry.payload {
            if sample.timestamp != current.timestamp {
                history.push(sample);
            }
        }
    }
    history
}

/// Latest decisions, command results and security events, oldest first
fn recent_events(memory: &MemoryStore, limit: usize) -> Vec<MemoryEntry> {
    let mut events: Vec<MemoryEntry> = [EntryType::Decision, EntryType::CommandResult, EntryType::SecurityEvent]
        .into_iter()
        .flat_map(|entry_type| {
            memory.query(&MemoryQuery {
                limit: Some(limit),
                ..MemoryQuery::of_type(entry_type)
            })
        })
        .collect();
    events.sort_by(|a, b| b.id.cmp(&a.id));
    events.truncate(limit);
    events.reverse();
    events
}

fn truncate_at(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

struct PromptContext<'a> {
    history: &'a History,
    events: &'a [MemoryEntry],
    last_failure: Option<&'a str>,
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

/// Summary prompt; past events are cut first, then recent readings, when over `max_chars`
fn build_prompt(signal: &Signal, sample: &MetricSample, context: &PromptContext<'_>, max_chars: usize) -> String {
    let load = sample
        .load_average
        .map(|l| format!("{:.2}/{:.2}/{:.2}", l.one, l.five, l.fifteen));
    let head = format!(
        "You are monitoring a Linux host.\nTrigger: {signal}.\nCurrent: cpu {}%, memory {}%, disk {}%, connections {}, load {}, processes {}.\n",
        fmt_opt(sample.cpu_percent),
        fmt_opt(sample.memory_percent),
        fmt_opt(sample.disk_percent),
        fmt_opt(sample.network_connection_count),
        fmt_opt(load),
        fmt_opt(sample.process_count),
    );
    let tail = "Suggest at most one read-only diagnostic command. Reply with a single JSON object: \
                {\"command\": \"<command or null>\", \"rationale\": \"<why>\", \"risk_score\": <0.0-1.0>}\n";

    let series = context.history.series(signal.resource);
    let recent: Vec<String> = series.iter().rev().take(20).rev().map(|v| format!("{v:.1}")).collect();
    let mut body = format!("Recent {}: {}\n", signal.resource, recent.join(", "));
    if let Some(failure) = context.last_failure {
        body.push_str(&format!("Previous command failed: {failure}\n"));
    }
    if !context.events.is_empty() {
        body.push_str("Recent events:\n");
        for entry in context.events {
            body.push_str(&format!(
                "- {} {} {}: {}\n",
                entry.timestamp.format("%H:%M:%S"),
                entry.level(),
                entry.component(),
                entry.message()
            ));
        }
    }
    truncate_at(&mut body, max_chars.saturating_sub(head.len() + tail.len()));

    let mut prompt = head;
    prompt.push_str(&body);
    prompt.push_str(tail);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::config::MemoryConfig;
    use crate::memory::{priority, TaskStatus};
    use crate::testing::{memory_store, sample_with, test_config, ScriptedBackend};
    use uuid::Uuid;

    const CPU_SUGGESTION: &str =
        "{\"command\": \"ps aux --sort=-%cpu\", \"rationale\": \"cpu climbing\", \"risk_score\": 0.1}";

    fn engine(backend: Option<ScriptedBackend>) -> DecisionEngine {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        DecisionEngine::new(&config, backend.map(|b| Box::new(b) as Box<dyn ReasoningBackend>))
    }

    fn remember(memory: &MemoryStore, sample: &MetricSample) {
        memory
            .record(EntryType::Metric, Payload::Metrics(sample.clone()), priority::INFO)
            .unwrap();
    }

    /// Record the sample the way the collector does, then decide on it
    async fn observe(
        engine: &mut DecisionEngine,
        memory: &MemoryStore,
        cycle: u64,
        sample: MetricSample,
        cancel: &CancellationToken,
    ) -> Decision {
        remember(memory, &sample);
        engine.decide(cycle, &sample, memory, cancel).await
    }

    async fn rising_cpu(engine: &mut DecisionEngine, memory: &MemoryStore, cancel: &CancellationToken) -> Decision {
        let mut last = None;
        for i in 0..5 {
            let sample = sample_with(20.0 + i as f32 * 10.0, 30.0, 40.0);
            last = Some(observe(engine, memory, i, sample, cancel).await);
        }
        last.unwrap()
    }

    fn failed_result(command: &str) -> ExecutionResult {
        ExecutionResult {
            task_id: Uuid::new_v4(),
            command: command.to_string(),
            status: TaskStatus::Failed,
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "ss: permission denied\nmore".to_string(),
            duration_ms: 4,
            truncated: false,
            timed_out: false,
        }
    }

    #[tokio::test]
    async fn test_cpu_breach_yields_rule_candidate() {
        let (_dir, memory) = memory_store(100);
        let mut engine = engine(None);
        let decision = observe(&mut engine, &memory, 1, sample_with(95.0, 30.0, 40.0), &CancellationToken::new()).await;
        assert_eq!(decision.outcome, DecisionOutcome::ThresholdTriggered);
        assert_eq!(engine.phase(), CyclePhase::ThresholdTriggered);
        let candidate = decision.candidate.unwrap();
        assert_eq!(candidate.source, CandidateSource::RuleBased);
        assert_eq!(candidate.command, "ps aux --sort=-%cpu");
        assert!(candidate.risk_score > 0.0);
    }

    #[tokio::test]
    async fn test_disk_wins_over_memory() {
        let (_dir, memory) = memory_store(100);
        let mut engine = engine(None);
        let decision = observe(&mut engine, &memory, 1, sample_with(10.0, 95.0, 99.0), &CancellationToken::new()).await;
        let candidate = decision.candidate.unwrap();
        assert_eq!(candidate.command, "df -h");
    }

    #[tokio::test]
    async fn test_breach_suppresses_backend() {
        let (_dir, memory) = memory_store(100);
        let backend = ScriptedBackend::new(vec![]);
        let mut engine = engine(Some(backend.clone()));
        let cancel = CancellationToken::new();
        for i in 0..4 {
            observe(&mut engine, &memory, i, sample_with(50.0 + i as f32 * 5.0, 30.0, 40.0), &cancel).await;
        }
        let decision = observe(&mut engine, &memory, 5, sample_with(90.0, 30.0, 40.0), &cancel).await;
        assert_eq!(decision.outcome, DecisionOutcome::ThresholdTriggered);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_trend_consults_backend() {
        let (_dir, memory) = memory_store(100);
        let backend = ScriptedBackend::new(vec![Ok(CPU_SUGGESTION.into())]);
        let mut engine = engine(Some(backend.clone()));
        let decision = rising_cpu(&mut engine, &memory, &CancellationToken::new()).await;

        assert_eq!(decision.outcome, DecisionOutcome::BackendConsult);
        assert!(decision.trigger.unwrap().contains("cpu"));
        assert_eq!(decision.candidate.unwrap().source, CandidateSource::ReasoningBackend);
        assert_eq!(backend.calls(), 1);
        assert!(backend.prompts()[0].contains("Trigger: cpu rising"));
    }

    #[tokio::test]
    async fn test_fresh_engine_sees_trend_already_in_memory() {
        let (_dir, memory) = memory_store(100);
        for cpu in [20.0, 30.0, 40.0, 50.0] {
            remember(&memory, &sample_with(cpu, 30.0, 40.0));
        }
        let backend = ScriptedBackend::new(vec![Ok(CPU_SUGGESTION.into())]);
        let mut engine = engine(Some(backend.clone()));

        let decision = observe(&mut engine, &memory, 1, sample_with(60.0, 30.0, 40.0), &CancellationToken::new()).await;
        assert_eq!(decision.outcome, DecisionOutcome::BackendConsult);
        assert_eq!(backend.calls(), 1);
        assert!(backend.prompts()[0].contains("Recent cpu: 20.0, 30.0, 40.0, 50.0\n"));
    }

    #[tokio::test]
    async fn test_trend_survives_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("memory.jsonl");
        {
            let memory = MemoryStore::open(&log, MemoryConfig::default()).unwrap();
            let started = chrono::Utc::now();
            for cpu in [20.0, 30.0, 40.0, 50.0] {
                remember(&memory, &sample_with(cpu, 30.0, 40.0));
            }
            // Bucket still open, so the raw samples are migrated rather than summarized
            memory.compact_at(started).unwrap();
        }

        let memory = MemoryStore::open(&log, MemoryConfig::default()).unwrap();
        let backend = ScriptedBackend::new(vec![Ok(CPU_SUGGESTION.into())]);
        let mut engine = engine(Some(backend.clone()));
        let decision = observe(&mut engine, &memory, 1, sample_with(60.0, 30.0, 40.0), &CancellationToken::new()).await;
        assert_eq!(decision.outcome, DecisionOutcome::BackendConsult);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_prompt_carries_recent_events_and_last_failure() {
        let (_dir, memory) = memory_store(100);
        let failed = failed_result("ss -s");
        memory
            .record(EntryType::CommandResult, Payload::Task(failed.to_task_record(3)), priority::RESOURCE_ALERT)
            .unwrap();
        let backend = ScriptedBackend::new(vec![Ok(CPU_SUGGESTION.into()), Ok(CPU_SUGGESTION.into())]);
        let mut engine = engine(Some(backend.clone()));
        let cancel = CancellationToken::new();

        for (i, cpu) in [20.0, 30.0, 40.0, 50.0].into_iter().enumerate() {
            observe(&mut engine, &memory, i as u64, sample_with(cpu, 30.0, 40.0), &cancel).await;
        }
        engine.note_execution(&failed);
        observe(&mut engine, &memory, 5, sample_with(60.0, 30.0, 40.0), &cancel).await;
        let prompt = &backend.prompts()[0];
        assert!(prompt.contains("Previous command failed: ss -s finished Failed (exit 2): ss: permission denied"));
        assert!(prompt.contains("Recent events:"));
        assert!(prompt.contains("ss -s finished Failed"));

        // Reported to the next cycle only
        observe(&mut engine, &memory, 6, sample_with(70.0, 30.0, 40.0), &cancel).await;
        assert_eq!(backend.calls(), 2);
        assert!(!backend.prompts()[1].contains("Previous command failed"));
    }

    #[test]
    fn test_successful_execution_clears_failure() {
        let mut engine = engine(None);
        engine.note_execution(&failed_result("ss -s"));
        assert!(engine.last_failure.is_some());
        let ok = ExecutionResult {
            status: TaskStatus::Succeeded,
            exit_code: Some(0),
            ..failed_result("ss -s")
        };
        engine.note_execution(&ok);
        assert!(engine.last_failure.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_completion_is_no_action() {
        let (_dir, memory) = memory_store(100);
        let backend = ScriptedBackend::new(vec![Ok("restart everything".into())]);
        let mut engine = engine(Some(backend));
        let decision = rising_cpu(&mut engine, &memory, &CancellationToken::new()).await;
        assert_eq!(decision.outcome, DecisionOutcome::NoAction);
        assert!(decision.candidate.is_none());
        assert!(decision.failure.unwrap().contains("no JSON object"));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let (_dir, memory) = memory_store(100);
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::Server { status: 503 }),
            Err(BackendError::Timeout(Duration::from_millis(10))),
            Ok("{\"command\": \"ps aux\", \"rationale\": \"look\", \"risk_score\": 0.1}".into()),
        ]);
        let mut engine = engine(Some(backend.clone()));
        let decision = rising_cpu(&mut engine, &memory, &CancellationToken::new()).await;
        assert_eq!(decision.outcome, DecisionOutcome::BackendConsult);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_starts_cooldown() {
        let (_dir, memory) = memory_store(100);
        let backend = ScriptedBackend::new(vec![Err(BackendError::Auth { status: 401 })]);
        let mut engine = engine(Some(backend.clone()));
        let cancel = CancellationToken::new();

        let decision = rising_cpu(&mut engine, &memory, &cancel).await;
        assert_eq!(decision.outcome, DecisionOutcome::NoAction);
        assert!(decision.failure.unwrap().contains("authentication"));
        assert_eq!(backend.calls(), 1);

        let decision = observe(&mut engine, &memory, 6, sample_with(75.0, 30.0, 40.0), &cancel).await;
        assert_eq!(decision.failure.as_deref(), Some("backend cooling down"));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_quiet_cycle_is_not_notable() {
        let (_dir, memory) = memory_store(100);
        let mut engine = engine(None);
        let decision = observe(&mut engine, &memory, 1, sample_with(10.0, 10.0, 10.0), &CancellationToken::new()).await;
        assert_eq!(decision.outcome, DecisionOutcome::NoAction);
        assert!(!decision.is_notable());
    }

    #[test]
    fn test_risk_scales_with_overshoot() {
        let small = Breach {
            resource: Resource::Cpu,
            value: 82.0,
            threshold: 80.0,
        };
        let large = Breach { value: 99.0, ..small };
        assert!(small.risk_score() < large.risk_score());
        assert!(large.risk_score() <= 0.5);
    }

    #[test]
    fn test_prompt_respects_budget() {
        let mut history = History::new(100);
        for i in 0..100 {
            history.push(sample_with(i as f32 * 0.5, 10.0, 10.0));
        }
        let signal = Signal {
            resource: Resource::Cpu,
            kind: SignalKind::Trend { rise: 10.0 },
        };
        let context = PromptContext {
            history: &history,
            events: &[],
            last_failure: Some("ss -s finished Failed (exit 1)"),
        };
        let prompt = build_prompt(&signal, &sample_with(55.0, 10.0, 10.0), &context, 400);
        assert!(prompt.len() <= 400 || !prompt.contains("Recent"));
        assert!(prompt.contains("risk_score"));
    }
}
