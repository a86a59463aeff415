//! Shared fakes for unit tests

use crate::backend::{BackendError, ReasoningBackend};
use crate::config::{Config, MemoryConfig};
use crate::memory::MemoryStore;
use crate::metrics::{CollectionError, LoadAverage, MetricField, MetricSample, MetricsProbe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Probe returning fixed readings; `None` fields fail as unavailable
#[derive(Debug, Clone)]
pub struct FakeProbe {
    pub cpu: Option<f32>,
    pub memory: Option<f32>,
    pub disk: Option<f32>,
    pub network: Option<u32>,
    pub load: Option<LoadAverage>,
    pub processes: Option<u32>,
}

impl FakeProbe {
    pub fn healthy(cpu: f32, memory: f32, disk: f32) -> Self {
        Self {
            cpu: Some(cpu),
            memory: Some(memory),
            disk: Some(disk),
            network: Some(12),
            load: Some(LoadAverage {
                one: 0.5,
                five: 0.4,
                fifteen: 0.3,
            }),
            processes: Some(150),
        }
    }

    pub fn broken() -> Self {
        Self {
            cpu: None,
            memory: None,
            disk: None,
            network: None,
            load: None,
            processes: None,
        }
    }
}

fn or_unavailable<T>(value: Option<T>, field: MetricField) -> Result<T, CollectionError> {
    value.ok_or_else(|| CollectionError::Unavailable(field, "fake probe".into()))
}

impl MetricsProbe for FakeProbe {
    fn cpu_percent(&mut self) -> Result<f32, CollectionError> {
        or_unavailable(self.cpu, MetricField::Cpu)
    }

    fn memory_percent(&mut self) -> Result<f32, CollectionError> {
        or_unavailable(self.memory, MetricField::Memory)
    }

    fn disk_percent(&mut self) -> Result<f32, CollectionError> {
        or_unavailable(self.disk, MetricField::Disk)
    }

    fn network_connections(&mut self) -> Result<u32, CollectionError> {
        or_unavailable(self.network, MetricField::Network)
    }

    fn load_average(&mut self) -> Result<LoadAverage, CollectionError> {
        or_unavailable(self.load, MetricField::LoadAverage)
    }

    fn process_count(&mut self) -> Result<u32, CollectionError> {
        or_unavailable(self.processes, MetricField::Processes)
    }
}

/// Backend replaying a fixed script; clones share the script and counters
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<Result<String, BackendError>>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<String, BackendError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn complete(&self, prompt: &str, _timeout: Duration) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::InvalidResponse("script exhausted".into())))
    }
}

pub fn memory_store(capacity: usize) -> (TempDir, MemoryStore) {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig {
        short_term_capacity: capacity,
        ..MemoryConfig::default()
    };
    let store = MemoryStore::open(&dir.path().join("memory.jsonl"), config).unwrap();
    (dir, store)
}

/// Defaults with state under `dir` and millisecond backoffs
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.agent.state_dir = dir.to_path_buf();
    config.agent.interval_secs = 1;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter = false;
    config.execution.timeout_secs = 5;
    config
}

pub fn sample_at(timestamp: DateTime<Utc>, cpu: f32) -> MetricSample {
    MetricSample {
        timestamp,
        cpu_percent: Some(cpu),
        memory_percent: Some(30.0),
        disk_percent: Some(40.0),
        network_connection_count: Some(12),
        load_average: Some(LoadAverage {
            one: 0.5,
            five: 0.4,
            fifteen: 0.3,
        }),
        process_count: Some(150),
        missing: Vec::new(),
    }
}

pub fn sample_with(cpu: f32, memory: f32, disk: f32) -> MetricSample {
    MetricSample {
        memory_percent: Some(memory),
        disk_percent: Some(disk),
        ..sample_at(Utc::now(), cpu)
    }
}
