use super::records::MetricSummary;
use super::{priority, EntryType, MemoryEntry, Payload, PersistenceError};
use crate::lockfile::FileLock;
use crate::metrics::MetricSample;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append-only JSON-lines history
///
/// Appends and compaction hold `<log>.lock`, so a rewrite never loses a line
/// another process appended meanwhile.
pub struct LongTermStore {
    path: PathBuf,
    lock_path: PathBuf,
    entries: Vec<MemoryEntry>,
}

/// What a compaction pass may drop or merge
pub struct CompactionPolicy {
    pub now: DateTime<Utc>,
    pub retention: Duration,
    pub durable_priority: u8,
    pub bucket_secs: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CompactionReport {
    pub migrated: usize,
    pub expired: usize,
    pub merged: usize,
    pub summaries: usize,
    pub rewritten: bool,
    /// Unreadable lines moved to `<log>.corrupt`
    pub quarantined: usize,
}

/// On-disk line: the entry plus the fields log tooling greps for
#[derive(Serialize)]
struct LogRecord<'a> {
    level: &'static str,
    component: &'static str,
    message: String,
    #[serde(flatten)]
    entry: &'a MemoryEntry,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn encode(entry: &MemoryEntry) -> Result<String, PersistenceError> {
    let record = LogRecord {
        level: entry.level(),
        component: entry.component(),
        message: entry.message(),
        entry,
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}

struct Loaded {
    entries: Vec<MemoryEntry>,
    unreadable: Vec<String>,
}

/// Parse the log. Lines that do not decode (a torn tail after a crash, or
/// damage anywhere else) are returned separately, never fatal.
fn load(path: &Path) -> Result<Loaded, PersistenceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Loaded {
                entries: Vec::new(),
                unreadable: Vec::new(),
            })
        }
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut loaded = Loaded {
        entries: Vec::new(),
        unreadable: Vec::new(),
    };
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryEntry>(line) {
            Ok(entry) => loaded.entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable memory record");
                loaded.unreadable.push(line.to_string());
            }
        }
    }
    Ok(loaded)
}

/// True when the file is non-empty and its last byte is not a newline
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl LongTermStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let loaded = load(path)?;
        debug!(
            path = %path.display(),
            entries = loaded.entries.len(),
            unreadable = loaded.unreadable.len(),
            "long-term memory loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("jsonl.lock"),
            entries: loaded.entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn max_id(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.id).max()
    }

    fn lock(&self) -> Result<FileLock, PersistenceError> {
        FileLock::exclusive(&self.lock_path).map_err(io_error(&self.lock_path))
    }

    pub fn append(&mut self, entry: &MemoryEntry) -> Result<(), PersistenceError> {
        let mut line = encode(entry)?;
        let _lock = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        // Don't glue the new record onto a torn tail
        if ends_mid_line(&mut file).map_err(io_error(&self.path))? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes()).map_err(io_error(&self.path))?;
        file.sync_data().map_err(io_error(&self.path))?;
        self.entries.push(entry.clone());
        Ok(())
    }

    /// Expire old non-durable entries and fold raw metric runs into summaries.
    /// The file is rewritten only if the result differs from what is on disk.
    pub fn compact(
        &mut self,
        policy: &CompactionPolicy,
        next_id: &mut dyn FnMut() -> Result<u64, PersistenceError>,
    ) -> Result<CompactionReport, PersistenceError> {
        let _lock = self.lock()?;
        // Pick up lines other processes appended since open
        let loaded = load(&self.path)?;
        self.entries = loaded.entries;
        let mut report = CompactionReport::default();
        if !loaded.unreadable.is_empty() {
            self.quarantine(&loaded.unreadable)?;
            report.quarantined = loaded.unreadable.len();
        }
        let cutoff = policy.now - policy.retention;

        let kept: Vec<&MemoryEntry> = self
            .entries
            .iter()
            .filter(|e| {
                let expired = e.timestamp < cutoff && e.priority < policy.durable_priority;
                if expired {
                    report.expired += 1;
                }
                !expired
            })
            .collect();

        let mut compacted = Vec::with_capacity(kept.len());
        let mut i = 0;
        while i < kept.len() {
            let Some(bucket) = policy.summary_bucket(kept[i]) else {
                compacted.push(kept[i].clone());
                i += 1;
                continue;
            };

            let mut j = i + 1;
            while j < kept.len() && policy.summary_bucket(kept[j]) == Some(bucket) {
                j += 1;
            }

            let run = &kept[i..j];
            if run.len() >= 2 {
                let samples: Vec<&MetricSample> = run
                    .iter()
                    .filter_map(|e| match &e.payload {
                        Payload::Metrics(sample) => Some(sample),
                        _ => None,
                    })
                    .collect();
                let ids = run.iter().map(|e| e.id).collect();
                compacted.push(MemoryEntry {
                    id: next_id()?,
                    timestamp: run[run.len() - 1].timestamp,
                    entry_type: EntryType::Metric,
                    priority: run.iter().map(|e| e.priority).max().unwrap_or(priority::INFO),
                    payload: Payload::MetricsSummary(MetricSummary::from_samples(ids, &samples)),
                });
                report.merged += run.len();
                report.summaries += 1;
            } else {
                compacted.push(kept[i].clone());
            }
            i = j;
        }

        if compacted != self.entries || report.quarantined > 0 {
            self.rewrite(&compacted)?;
            self.entries = compacted;
            report.rewritten = true;
        }
        Ok(report)
    }

    /// Keep undecodable lines next to the log instead of dropping them
    fn quarantine(&self, lines: &[String]) -> Result<(), PersistenceError> {
        let sidecar = self.path.with_extension("jsonl.corrupt");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sidecar)
            .map_err(io_error(&sidecar))?;
        for line in lines {
            writeln!(file, "{line}").map_err(io_error(&sidecar))?;
        }
        file.sync_data().map_err(io_error(&sidecar))?;
        warn!(
            path = %self.path.display(),
            sidecar = %sidecar.display(),
            lines = lines.len(),
            "moved unreadable memory records out of the log"
        );
        Ok(())
    }

    fn rewrite(&self, entries: &[MemoryEntry]) -> Result<(), PersistenceError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut content = String::new();
        for entry in entries {
            content.push_str(&encode(entry)?);
        }

        let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
        file.write_all(content.as_bytes()).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        fs::rename(&tmp, &self.path).map_err(io_error(&self.path))?;
        Ok(())
    }
}

impl CompactionPolicy {
    /// Bucket index for raw, non-durable metric entries whose bucket has closed
    fn summary_bucket(&self, entry: &MemoryEntry) -> Option<i64> {
        if !matches!(entry.payload, Payload::Metrics(_)) || entry.priority >= self.durable_priority {
            return None;
        }
        let bucket = entry.timestamp.timestamp().div_euclid(self.bucket_secs);
        let closed = (bucket + 1) * self.bucket_secs <= self.now.timestamp();
        closed.then_some(bucket)
    }
}
