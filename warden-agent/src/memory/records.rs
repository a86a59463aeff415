//! Payloads carried by memory entries, one shape per concern

use crate::decision::{CandidateSource, DecisionOutcome};
use crate::metrics::MetricSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Metrics(MetricSample),
    MetricsSummary(MetricSummary),
    CollectionFailure {
        consecutive_failures: u32,
        reason: String,
    },
    Decision(DecisionRecord),
    Security(SecurityRecord),
    Task(TaskRecord),
    Resume {
        recovery_ref: String,
    },
}

/// min/max/avg over the values folded into a summary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Stat {
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (count > 0).then(|| Stat {
            min,
            max,
            avg: sum / count as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub samples: u32,
    pub merged_ids: Vec<u64>,
    pub cpu_percent: Option<Stat>,
    pub memory_percent: Option<Stat>,
    pub disk_percent: Option<Stat>,
    pub network_connection_count: Option<Stat>,
    pub load_one: Option<Stat>,
    pub process_count: Option<Stat>,
}

impl MetricSummary {
    pub fn from_samples(ids: Vec<u64>, samples: &[&MetricSample]) -> Self {
        let stat = |f: &dyn Fn(&MetricSample) -> Option<f64>| Stat::from_values(samples.iter().filter_map(|s| f(s)));
        Self {
            window_start: samples.iter().map(|s| s.timestamp).min().unwrap_or_else(Utc::now),
            window_end: samples.iter().map(|s| s.timestamp).max().unwrap_or_else(Utc::now),
            samples: samples.len() as u32,
            merged_ids: ids,
            cpu_percent: stat(&|s| s.cpu_percent.map(f64::from)),
            memory_percent: stat(&|s| s.memory_percent.map(f64::from)),
            disk_percent: stat(&|s| s.disk_percent.map(f64::from)),
            network_connection_count: stat(&|s| s.network_connection_count.map(f64::from)),
            load_one: stat(&|s| s.load_average.map(|l| l.one)),
            process_count: stat(&|s| s.process_count.map(f64::from)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub cycle: u64,
    pub outcome: DecisionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CandidateSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEvent {
    CommandAllowed,
    CommandRejected,
    IntegrityViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRecord {
    pub event: SecurityEvent,
    /// Sanitized command, or the file path for integrity events
    pub subject: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CandidateSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    SpawnFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    pub cycle: u64,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_folding() {
        let stat = Stat::from_values([10.0, 30.0, 20.0]).unwrap();
        assert_eq!(stat.min, 10.0);
        assert_eq!(stat.max, 30.0);
        assert!((stat.avg - 20.0).abs() < f64::EPSILON);
        assert!(Stat::from_values(std::iter::empty()).is_none());
    }

    #[test]
    fn test_payload_is_tagged_by_concern() {
        let payload = Payload::Resume {
            recovery_ref: "memory:42".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["resume"]["recovery_ref"], "memory:42");
    }
}
