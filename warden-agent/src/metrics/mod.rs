//! System metrics collection
//!
//! Provides one `MetricSample` per cycle:
//! - CPU usage and load averages
//! - Memory usage percentage
//! - Disk usage of the root filesystem
//! - Open network connection count (from /proc/net)
//! - Process table size
//!
//! Collection fails soft: an unavailable source leaves its field empty and
//! flags it in `missing`. Three consecutive total failures escalate.

use crate::memory::{priority, EntryType, MemoryStore, Payload, PersistenceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, System};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Consecutive all-fields failures before an error-level entry is recorded
pub const ESCALATE_AFTER_TOTAL_FAILURES: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollectionError {
    #[error("{0} source unavailable: {1}")]
    Unavailable(MetricField, String),
    #[error("{0} reading out of range: {1}")]
    OutOfRange(MetricField, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Cpu,
    Memory,
    Disk,
    Network,
    LoadAverage,
    Processes,
}

impl std::fmt::Display for MetricField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MetricField::Cpu => "cpu",
            MetricField::Memory => "memory",
            MetricField::Disk => "disk",
            MetricField::Network => "network",
            MetricField::LoadAverage => "load_average",
            MetricField::Processes => "processes",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// One immutable reading of the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub network_connection_count: Option<u32>,
    pub load_average: Option<LoadAverage>,
    pub process_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MetricField>,
}

impl MetricSample {
    pub fn is_degraded(&self) -> bool {
        !self.missing.is_empty()
    }

    pub fn is_total_failure(&self) -> bool {
        self.cpu_percent.is_none()
            && self.memory_percent.is_none()
            && self.disk_percent.is_none()
            && self.network_connection_count.is_none()
            && self.load_average.is_none()
            && self.process_count.is_none()
    }
}

/// Source of raw readings; the production probe wraps sysinfo
pub trait MetricsProbe: Send {
    /// Called once per cycle before the individual readings
    fn refresh(&mut self) {}
    fn cpu_percent(&mut self) -> Result<f32, CollectionError>;
    fn memory_percent(&mut self) -> Result<f32, CollectionError>;
    fn disk_percent(&mut self) -> Result<f32, CollectionError>;
    fn network_connections(&mut self) -> Result<u32, CollectionError>;
    fn load_average(&mut self) -> Result<LoadAverage, CollectionError>;
    fn process_count(&mut self) -> Result<u32, CollectionError>;
}

/// Cross-platform probe backed by sysinfo
pub struct SysinfoProbe {
    sys: System,
    disks: Disks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        // First CPU refresh only establishes the baseline
        sys.refresh_cpu();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProbe for SysinfoProbe {
    fn refresh(&mut self) {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.sys.refresh_processes();
        self.disks.refresh_list();
    }

    fn cpu_percent(&mut self) -> Result<f32, CollectionError> {
        if self.sys.cpus().is_empty() {
            return Err(CollectionError::Unavailable(MetricField::Cpu, "no cpu reported".into()));
        }
        percent(MetricField::Cpu, self.sys.global_cpu_info().cpu_usage() as f64)
    }

    fn memory_percent(&mut self) -> Result<f32, CollectionError> {
        let total = self.sys.total_memory();
        if total == 0 {
            return Err(CollectionError::Unavailable(MetricField::Memory, "total memory is zero".into()));
        }
        let used = total.saturating_sub(self.sys.available_memory());
        percent(MetricField::Memory, used as f64 / total as f64 * 100.0)
    }

    fn disk_percent(&mut self) -> Result<f32, CollectionError> {
        let root = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .ok_or_else(|| CollectionError::Unavailable(MetricField::Disk, "no disk mounted at /".into()))?;
        let total = root.total_space();
        if total == 0 {
            return Err(CollectionError::Unavailable(MetricField::Disk, "root filesystem reports zero size".into()));
        }
        let used = total.saturating_sub(root.available_space());
        percent(MetricField::Disk, used as f64 / total as f64 * 100.0)
    }

    fn network_connections(&mut self) -> Result<u32, CollectionError> {
        count_proc_net_connections(Path::new("/proc/net"))
    }

    fn load_average(&mut self) -> Result<LoadAverage, CollectionError> {
        if !cfg!(unix) {
            return Err(CollectionError::Unavailable(MetricField::LoadAverage, "not supported on this platform".into()));
        }
        let load = System::load_average();
        Ok(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        })
    }

    fn process_count(&mut self) -> Result<u32, CollectionError> {
        let count = self.sys.processes().len();
        if count == 0 {
            return Err(CollectionError::Unavailable(MetricField::Processes, "empty process table".into()));
        }
        Ok(count as u32)
    }
}

fn percent(field: MetricField, value: f64) -> Result<f32, CollectionError> {
    if !value.is_finite() || !(0.0..=100.0 + f64::EPSILON).contains(&value) {
        return Err(CollectionError::OutOfRange(field, value));
    }
    Ok(value as f32)
}

/// Count socket table rows across tcp/udp (v4 and v6), skipping header lines
fn count_proc_net_connections(dir: &Path) -> Result<u32, CollectionError> {
    let mut total = 0u32;
    let mut readable = 0;
    for table in ["tcp", "tcp6", "udp", "udp6"] {
        match std::fs::read_to_string(dir.join(table)) {
            Ok(content) => {
                readable += 1;
                total += content.lines().skip(1).filter(|l| !l.trim().is_empty()).count() as u32;
            }
            Err(e) => debug!("cannot read {}/{}: {}", dir.display(), table, e),
        }
    }
    if readable == 0 {
        return Err(CollectionError::Unavailable(
            MetricField::Network,
            format!("no socket tables under {}", dir.display()),
        ));
    }
    Ok(total)
}

/// Samples the probe and records the sample in memory
pub struct Collector {
    probe: Box<dyn MetricsProbe>,
    consecutive_total_failures: u32,
}

impl Collector {
    pub fn new(probe: Box<dyn MetricsProbe>) -> Self {
        Self {
            probe,
            consecutive_total_failures: 0,
        }
    }

    pub fn consecutive_total_failures(&self) -> u32 {
        self.consecutive_total_failures
    }

    /// Take one sample without touching memory (used by `warden monitor`)
    pub fn sample(&mut self) -> MetricSample {
        self.probe.refresh();

        let mut missing = Vec::new();
        let mut failures = Vec::new();

        let cpu_percent = keep(self.probe.cpu_percent(), MetricField::Cpu, &mut missing, &mut failures);
        let memory_percent = keep(self.probe.memory_percent(), MetricField::Memory, &mut missing, &mut failures);
        let disk_percent = keep(self.probe.disk_percent(), MetricField::Disk, &mut missing, &mut failures);
        let network_connection_count =
            keep(self.probe.network_connections(), MetricField::Network, &mut missing, &mut failures);
        let load_average = keep(self.probe.load_average(), MetricField::LoadAverage, &mut missing, &mut failures);
        let process_count = keep(self.probe.process_count(), MetricField::Processes, &mut missing, &mut failures);

        for failure in &failures {
            warn!(error = %failure, "metric collection degraded");
        }

        MetricSample {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            disk_percent,
            network_connection_count,
            load_average,
            process_count,
            missing,
        }
    }

    /// Sample, record as a low-priority metric entry, escalate repeated total failures
    pub fn collect(&mut self, memory: &MemoryStore) -> Result<MetricSample, PersistenceError> {
        let sample = self.sample();

        if sample.is_total_failure() {
            self.consecutive_total_failures += 1;
            warn!(
                consecutive = self.consecutive_total_failures,
                "every metric source failed this cycle"
            );
        } else {
            self.consecutive_total_failures = 0;
        }

        memory.record(EntryType::Metric, Payload::Metrics(sample.clone()), priority::INFO)?;

        if self.consecutive_total_failures >= ESCALATE_AFTER_TOTAL_FAILURES
            && self.consecutive_total_failures % ESCALATE_AFTER_TOTAL_FAILURES == 0
        {
            error!(
                consecutive = self.consecutive_total_failures,
                "metric collection failing repeatedly"
            );
            memory.record(
                EntryType::Metric,
                Payload::CollectionFailure {
                    consecutive_failures: self.consecutive_total_failures,
                    reason: "all metric sources unavailable".to_string(),
                },
                priority::CRITICAL,
            )?;
        }

        Ok(sample)
    }
}

fn keep<T>(
    reading: Result<T, CollectionError>,
    field: MetricField,
    missing: &mut Vec<MetricField>,
    failures: &mut Vec<CollectionError>,
) -> Option<T> {
    match reading {
        Ok(value) => Some(value),
        Err(e) => {
            missing.push(field);
            failures.push(e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQuery;
    use crate::testing::{memory_store, FakeProbe};

    #[test]
    fn test_full_sample() {
        let mut collector = Collector::new(Box::new(FakeProbe::healthy(42.0, 55.0, 60.0)));
        let sample = collector.sample();
        assert_eq!(sample.cpu_percent, Some(42.0));
        assert_eq!(sample.memory_percent, Some(55.0));
        assert_eq!(sample.disk_percent, Some(60.0));
        assert!(!sample.is_degraded());
    }

    #[test]
    fn test_degraded_sample_flags_missing_fields() {
        let mut probe = FakeProbe::healthy(10.0, 20.0, 30.0);
        probe.disk = None;
        probe.network = None;
        let mut collector = Collector::new(Box::new(probe));

        let sample = collector.sample();
        assert!(sample.is_degraded());
        assert_eq!(sample.missing, vec![MetricField::Disk, MetricField::Network]);
        assert_eq!(sample.cpu_percent, Some(10.0));
        assert!(!sample.is_total_failure());
    }

    #[test]
    fn test_three_total_failures_escalate() {
        let (_dir, memory) = memory_store(64);
        let mut collector = Collector::new(Box::new(FakeProbe::broken()));

        for _ in 0..2 {
            collector.collect(&memory).unwrap();
        }
        let critical = MemoryQuery {
            min_priority: Some(priority::CRITICAL),
            ..Default::default()
        };
        assert!(memory.query(&critical).is_empty());

        collector.collect(&memory).unwrap();
        let escalations = memory.query(&critical);
        assert_eq!(escalations.len(), 1);
        assert!(matches!(
            escalations[0].payload,
            Payload::CollectionFailure { consecutive_failures: 3, .. }
        ));
        // Every cycle still recorded its (empty) sample
        assert_eq!(memory.query(&MemoryQuery::of_type(EntryType::Metric)).len(), 4);
    }

    #[test]
    fn test_recovery_resets_failure_streak() {
        let (_dir, memory) = memory_store(64);
        let mut collector = Collector::new(Box::new(FakeProbe::broken()));
        collector.collect(&memory).unwrap();
        collector.collect(&memory).unwrap();
        assert_eq!(collector.consecutive_total_failures(), 2);

        collector.probe = Box::new(FakeProbe::healthy(1.0, 1.0, 1.0));
        collector.collect(&memory).unwrap();
        assert_eq!(collector.consecutive_total_failures(), 0);
    }

    #[test]
    fn test_proc_net_counting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tcp"), "header\n 0: a\n 1: b\n").unwrap();
        std::fs::write(dir.path().join("udp"), "header\n 0: c\n").unwrap();
        assert_eq!(count_proc_net_connections(dir.path()).unwrap(), 3);

        let empty = tempfile::tempdir().unwrap();
        assert!(count_proc_net_connections(empty.path()).is_err());
    }

    #[test]
    fn test_percent_range_check() {
        assert!(percent(MetricField::Cpu, 50.0).is_ok());
        assert!(percent(MetricField::Cpu, f64::NAN).is_err());
        assert!(percent(MetricField::Cpu, 180.0).is_err());
    }
}
