//! Two-tier memory store
//!
//! - Short-term: bounded, priority-aware ring of recent entries
//! - Long-term: append-only JSON-lines log under the state directory
//!
//! `record` is the single insertion point. Entries at or above the persist
//! threshold are written through; the rest reach disk only if they survive
//! eviction until the next compaction.

mod buffer;
mod long_term;
pub mod records;

pub use buffer::ShortTermBuffer;
pub use long_term::{CompactionPolicy, CompactionReport, LongTermStore};
pub use records::{
    DecisionRecord, MetricSummary, Payload, SecurityEvent, SecurityRecord, Stat, TaskRecord, TaskStatus,
};

use crate::config::MemoryConfig;
use crate::lockfile::FileLock;
use crate::retry::{RetryError, RetryPolicy, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Entry priorities, higher is retained longer
pub mod priority {
    pub const INFO: u8 = 1;
    pub const WARNING: u8 = 2;
    pub const RESOURCE_ALERT: u8 = 3;
    pub const SECURITY: u8 = 4;
    pub const CRITICAL: u8 = 5;
}

/// Ids are reserved on disk in blocks so a restart never hands one out twice
const ID_BLOCK: u64 = 256;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode memory record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("id sequence {path} is unreadable ({content:?}); refusing to reissue ids")]
    CorruptSequence { path: PathBuf, content: String },
    #[error("memory entry ids exhausted")]
    IdsExhausted,
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
}

impl Retryable for PersistenceError {
    fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Io { .. })
    }
}

impl From<RetryError<PersistenceError>> for PersistenceError {
    fn from(err: RetryError<PersistenceError>) -> Self {
        match err {
            RetryError::Exhausted {
                operation,
                attempts,
                last,
                ..
            } => PersistenceError::Exhausted {
                operation,
                attempts,
                last: last.to_string(),
            },
            RetryError::Fatal { error, .. } => error,
            RetryError::Cancelled { operation } => PersistenceError::Exhausted {
                operation,
                attempts: 0,
                last: "cancelled".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Metric,
    Decision,
    CommandResult,
    SecurityEvent,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntryType::Metric => "metric",
            EntryType::Decision => "decision",
            EntryType::CommandResult => "command_result",
            EntryType::SecurityEvent => "security_event",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metric" => Ok(EntryType::Metric),
            "decision" => Ok(EntryType::Decision),
            "command_result" => Ok(EntryType::CommandResult),
            "security_event" => Ok(EntryType::SecurityEvent),
            other => Err(format!(
                "unknown entry type {other:?} (expected metric, decision, command_result or security_event)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub entry_type: EntryType,
    pub priority: u8,
    pub payload: Payload,
}

impl MemoryEntry {
    pub fn level(&self) -> &'static str {
        match self.priority {
            0 | priority::INFO => "info",
            priority::WARNING => "warning",
            priority::RESOURCE_ALERT => "alert",
            priority::SECURITY => "security",
            _ => "critical",
        }
    }

    pub fn component(&self) -> &'static str {
        match self.entry_type {
            EntryType::Metric => "collector",
            EntryType::Decision => "decision",
            EntryType::CommandResult => "executor",
            EntryType::SecurityEvent => "validator",
        }
    }

    /// One-line human summary stored next to the structured payload
    pub fn message(&self) -> String {
        match &self.payload {
            Payload::Metrics(s) if s.is_degraded() => format!("degraded sample, missing {:?}", s.missing),
            Payload::Metrics(_) => "metric sample".to_string(),
            Payload::MetricsSummary(s) => format!("summary of {} samples", s.samples),
            Payload::CollectionFailure {
                consecutive_failures, ..
            } => format!("metric collection failed {consecutive_failures} times in a row"),
            Payload::Decision(d) => match (&d.command, &d.failure) {
                (Some(command), _) => format!("cycle {}: {:?} proposed {command}", d.cycle, d.outcome),
                (None, Some(failure)) => format!("cycle {}: no action ({failure})", d.cycle),
                (None, None) => format!("cycle {}: {:?}", d.cycle, d.outcome),
            },
            Payload::Security(s) => format!("{:?}: {} ({})", s.event, s.subject, s.reason),
            Payload::Task(t) => format!("{} finished {:?} in {} ms", t.command, t.status, t.duration_ms),
            Payload::Resume { recovery_ref } => format!("resumed from {recovery_ref}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub entry_type: Option<EntryType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_priority: Option<u8>,
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn of_type(entry_type: EntryType) -> Self {
        Self {
            entry_type: Some(entry_type),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        self.entry_type.map_or(true, |t| entry.entry_type == t)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
            && self.min_priority.map_or(true, |p| entry.priority >= p)
    }
}

/// High-water mark persisted in `memory.seq`
///
/// Ids are reserved in blocks under `memory.seq.lock`, so the daemon and a
/// concurrent `warden exec` never hand out the same id.
struct IdSequence {
    path: PathBuf,
    lock_path: PathBuf,
    next: u64,
    reserved_until: u64,
}

fn read_high_water(path: &Path) -> Result<Option<u64>, PersistenceError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    // Always written by rename, so anything unparseable was not written by us
    content
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| PersistenceError::CorruptSequence {
            path: path.to_path_buf(),
            content: content.chars().take(32).collect(),
        })
}

fn write_high_water(path: &Path, value: u64) -> Result<(), PersistenceError> {
    let tmp = path.with_extension("seq.tmp");
    let io = |source| PersistenceError::Io {
        path: tmp.clone(),
        source,
    };
    let mut file = File::create(&tmp).map_err(io)?;
    file.write_all(value.to_string().as_bytes()).map_err(io)?;
    file.sync_all().map_err(io)?;
    std::fs::rename(&tmp, path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl IdSequence {
    fn open(path: PathBuf, max_seen: Option<u64>) -> Result<Self, PersistenceError> {
        let persisted = read_high_water(&path)?.unwrap_or(0);
        let after_log = match max_seen {
            Some(id) => id.checked_add(1).ok_or(PersistenceError::IdsExhausted)?,
            None => 1,
        };
        let next = persisted.max(after_log).max(1);
        Ok(Self {
            lock_path: path.with_extension("seq.lock"),
            path,
            next,
            reserved_until: next,
        })
    }

    fn allocate(&mut self) -> Result<u64, PersistenceError> {
        if self.next >= self.reserved_until {
            let _lock = FileLock::exclusive(&self.lock_path).map_err(|source| PersistenceError::Io {
                path: self.lock_path.clone(),
                source,
            })?;
            // Another process (`warden exec`) may have reserved past us
            let start = self.next.max(read_high_water(&self.path)?.unwrap_or(0));
            let reserved_until = start.checked_add(ID_BLOCK).ok_or(PersistenceError::IdsExhausted)?;
            write_high_water(&self.path, reserved_until)?;
            self.next = start;
            self.reserved_until = reserved_until;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    fn last_allocated(&self) -> Option<u64> {
        (self.next > 1).then(|| self.next - 1)
    }
}

/// Writer-side state; holding its lock serializes every mutation
struct WriterState {
    ids: IdSequence,
    /// Highest short-term id already present in the long-term log
    migrated_through: u64,
}

pub struct MemoryStore {
    config: MemoryConfig,
    persist_retry: RetryPolicy,
    writer: Mutex<WriterState>,
    short_term: RwLock<ShortTermBuffer>,
    long_term: RwLock<LongTermStore>,
}

impl MemoryStore {
    /// Open (or create) the store whose log lives at `log_path`; the id
    /// sequence file sits next to it.
    pub fn open(log_path: &Path, config: MemoryConfig) -> Result<Self, PersistenceError> {
        let long_term = LongTermStore::open(log_path)?;
        let ids = IdSequence::open(log_path.with_extension("seq"), long_term.max_id())?;
        let migrated_through = ids.last_allocated().unwrap_or(0);

        info!(
            path = %log_path.display(),
            persisted = long_term.entries().len(),
            next_id = ids.next,
            "memory store opened"
        );

        let persist_retry = RetryPolicy::new(
            config.persist_attempts,
            Duration::from_millis(50),
            Duration::from_millis(500),
        )
        .without_jitter();

        Ok(Self {
            short_term: RwLock::new(ShortTermBuffer::new(config.short_term_capacity)),
            long_term: RwLock::new(long_term),
            writer: Mutex::new(WriterState { ids, migrated_through }),
            persist_retry,
            config,
        })
    }

    pub fn record(&self, entry_type: EntryType, payload: Payload, priority: u8) -> Result<u64, PersistenceError> {
        self.record_at(Utc::now(), entry_type, payload, priority)
    }

    pub fn record_at(
        &self,
        timestamp: DateTime<Utc>,
        entry_type: EntryType,
        payload: Payload,
        priority: u8,
    ) -> Result<u64, PersistenceError> {
        let mut writer = self.writer.lock();
        let entry = MemoryEntry {
            id: writer.ids.allocate()?,
            timestamp,
            entry_type,
            priority,
            payload,
        };
        let id = entry.id;

        if priority >= self.config.persist_priority {
            let mut long_term = self.long_term.write();
            self.persist_retry
                .run_blocking("memory append", || long_term.append(&entry))
                .map_err(|e| {
                    let e = PersistenceError::from(e);
                    error!(id, error = %e, "failed to persist memory entry");
                    e
                })?;
        }

        if let Some(evicted) = self.short_term.write().push(entry) {
            debug!(id = evicted.id, priority = evicted.priority, "evicted from short-term memory");
        }
        Ok(id)
    }

    /// Matching entries from both tiers, newest first
    pub fn query(&self, query: &MemoryQuery) -> Vec<MemoryEntry> {
        let mut merged: BTreeMap<u64, MemoryEntry> = BTreeMap::new();
        {
            let long_term = self.long_term.read();
            for entry in long_term.entries().iter().filter(|e| query.matches(e)) {
                merged.insert(entry.id, entry.clone());
            }
        }
        {
            let short_term = self.short_term.read();
            for entry in short_term.iter().filter(|e| query.matches(e)) {
                merged.entry(entry.id).or_insert_with(|| entry.clone());
            }
        }

        let mut entries: Vec<MemoryEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        entries
    }

    pub fn compact(&self) -> Result<CompactionReport, PersistenceError> {
        self.compact_at(Utc::now())
    }

    pub fn compact_at(&self, now: DateTime<Utc>) -> Result<CompactionReport, PersistenceError> {
        let mut writer = self.writer.lock();
        let WriterState { ids, migrated_through } = &mut *writer;

        let pending: Vec<MemoryEntry> = self
            .short_term
            .read()
            .iter()
            .filter(|e| e.id > *migrated_through && e.priority < self.config.persist_priority)
            .cloned()
            .collect();

        let mut long_term = self.long_term.write();
        for entry in &pending {
            self.persist_retry
                .run_blocking("memory migrate", || long_term.append(entry))?;
        }
        if let Some(last) = self.short_term.read().iter().map(|e| e.id).max() {
            *migrated_through = (*migrated_through).max(last);
        }

        let policy = CompactionPolicy {
            now,
            retention: chrono::Duration::days(self.config.retention_days),
            durable_priority: self.config.durable_priority,
            bucket_secs: self.config.summary_bucket_secs,
        };
        let mut report = long_term.compact(&policy, &mut || ids.allocate())?;
        report.migrated = pending.len();

        info!(
            migrated = report.migrated,
            expired = report.expired,
            summaries = report.summaries,
            rewritten = report.rewritten,
            quarantined = report.quarantined,
            "memory compaction finished"
        );
        Ok(report)
    }

    /// Id of the most recently recorded entry, if any
    pub fn last_id(&self) -> Option<u64> {
        self.writer.lock().ids.last_allocated()
    }

    pub fn short_term_len(&self) -> usize {
        self.short_term.read().len()
    }

    pub fn long_term_entries(&self) -> Vec<MemoryEntry> {
        self.long_term.read().entries().to_vec()
    }

    pub fn log_path(&self) -> PathBuf {
        self.long_term.read().path().to_path_buf()
    }
}
