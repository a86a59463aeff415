//! Configuration management
//!
//! Handles:
//! - Resource thresholds and remediation priority order
//! - Memory store sizing, retention and priority thresholds
//! - Command policy (whitelist, blacklist, length, risk ceiling)
//! - Executor ceilings, retry discipline, reasoning backend endpoint
//! - Supervisor polling and restart ceiling
//!
//! Loaded once at startup from TOML (`WARDEN_CONFIG` or the OS config dir),
//! then `.env` / `WARDEN_*` overrides, then validated.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid environment override {key}={value}")]
    Env { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Monitored resource, also the key of the remediation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Disk,
    Memory,
    Cpu,
    Network,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Resource::Disk => "disk",
            Resource::Memory => "memory",
            Resource::Cpu => "cpu",
            Resource::Network => "network",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSettings,
    pub thresholds: ThresholdConfig,
    pub decision: DecisionConfig,
    pub memory: MemoryConfig,
    pub security: SecurityConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
    /// Path the configuration was loaded from (not serialized)
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub interval_secs: u64,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub network_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Highest priority first; only the first breached resource is acted on
    pub priority_order: Vec<Resource>,
    pub trend_window: usize,
    pub trend_min_delta: f32,
    pub anomaly_window: usize,
    pub anomaly_min_points: usize,
    pub anomaly_std_dev: f32,
    pub backend_cooldown_secs: u64,
    pub max_prompt_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub short_term_capacity: usize,
    /// Entries at or above this priority are written through to the long-term log
    pub persist_priority: u8,
    /// Entries at or above this priority survive compaction regardless of age
    pub durable_priority: u8,
    pub retention_days: i64,
    pub compaction_interval_secs: u64,
    pub summary_bucket_secs: i64,
    pub persist_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub max_command_length: usize,
    pub forbidden_chars: String,
    pub risk_ceiling: f64,
    pub verify_config_integrity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
    pub cpu_time_secs: u64,
    pub nice: i32,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_secs: u64,
    pub staleness_secs: i64,
    pub missed_heartbeats_before_restart: u32,
    pub failure_ceiling: u32,
    pub failure_window_secs: i64,
    pub termination_grace_secs: u64,
    /// Main loop binary; defaults to `warden` next to the watchdog executable
    pub agent_binary: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            state_dir: default_state_dir(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 80.0,
            disk_percent: 90.0,
            network_connections: 1000,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            priority_order: vec![Resource::Disk, Resource::Memory, Resource::Cpu, Resource::Network],
            trend_window: 5,
            trend_min_delta: 5.0,
            anomaly_window: 100,
            anomaly_min_points: 10,
            anomaly_std_dev: 2.0,
            backend_cooldown_secs: 300,
            max_prompt_chars: 4000,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 1000,
            persist_priority: 3,
            durable_priority: 4,
            retention_days: 7,
            compaction_interval_secs: 3600,
            summary_bucket_secs: 300,
            persist_attempts: 3,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        // Prefixes match whole tokens; tools with mutating subcommands are listed
        // by their read-only forms only
        let whitelist = [
            "ps", "top -b -n 1", "df", "du", "free", "ss", "netstat", "uptime", "w", "who",
            "last", "lsof", "iostat", "vmstat", "mpstat", "systemctl status",
            "ip addr show", "ip -s link show", "ip link show", "ip route show",
            "journalctl -n", "journalctl -u", "journalctl --no-pager",
        ];
        let blacklist = [
            r"\brm\s+-[a-z]*[rf]",
            r"\bmkfs",
            r"\bdd\b",
            r"\bshutdown\b",
            r"\breboot\b",
            r"\bchmod\s+777\b",
            r"\bchown\s+-r\b",
            r"\bpasswd\b",
            r"\buser(add|mod|del)\b",
            r"\beval\b",
            r"\bexec\b",
            r"\bsudo\b",
            r"\bkill(all)?\b",
            r"\bip\b.*\b(set|add|del|delete|flush|change|replace|append|prepend)\b",
            r"\bjournalctl\b.*--(vacuum|rotate|flush|sync|relinquish|smart-relinquish|setup-keys|update-catalog)",
            r"--files0-from",
            r"\bss\b.*(\s-[a-z]*k\b|--kill)",
        ];
        Self {
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            max_command_length: 256,
            forbidden_chars: ";&|`$<>\\".to_string(),
            risk_ceiling: 0.7,
            verify_config_integrity: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            memory_limit_mb: 256,
            cpu_time_secs: 10,
            nice: 10,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: true,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:8080/completion".to_string(),
            timeout_secs: 30,
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            staleness_secs: 180,
            missed_heartbeats_before_restart: 2,
            failure_ceiling: 5,
            failure_window_secs: 3600,
            termination_grace_secs: 5,
            agent_binary: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("warden")
}

impl AgentSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("warden.pid")
    }

    pub fn watchdog_pid_file(&self) -> PathBuf {
        self.state_dir.join("watchdog.pid")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.state_dir.join("heartbeat.json")
    }

    pub fn memory_log(&self) -> PathBuf {
        self.state_dir.join("memory.jsonl")
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.state_dir.join("supervisor.json")
    }
}

impl Config {
    /// Load config from `WARDEN_CONFIG` or the OS-specific location, then apply env overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like `load`, with an explicit file taking precedence over `WARDEN_CONFIG`
    pub fn load_from(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = match (explicit, std::env::var_os("WARDEN_CONFIG")) {
            (Some(p), _) => Some(p.to_path_buf()),
            (None, Some(p)) => Some(PathBuf::from(p)),
            (None, None) => Self::config_file_path().filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("warden");
        path.push("config.toml");
        Some(path)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("WARDEN_STATE_DIR") {
            self.agent.state_dir = PathBuf::from(dir);
        }
        if let Ok(value) = std::env::var("WARDEN_INTERVAL_SECS") {
            self.agent.interval_secs = value.parse().map_err(|_| ConfigError::Env {
                key: "WARDEN_INTERVAL_SECS".to_string(),
                value: value.clone(),
            })?;
        }
        if let Ok(endpoint) = std::env::var("WARDEN_BACKEND_ENDPOINT") {
            self.backend.endpoint = endpoint;
        }
        if let Ok(format) = std::env::var("WARDEN_LOG_FORMAT") {
            self.logging.format = match format.as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => {
                    return Err(ConfigError::Env {
                        key: "WARDEN_LOG_FORMAT".to_string(),
                        value: format,
                    })
                }
            };
        }
        Ok(())
    }

    /// Validate once at startup; returns non-fatal warnings
    /// Upper bound on one cycle: every backend attempt times out, then the command does
    pub fn slowest_cycle(&self) -> Duration {
        let consult = if self.backend.enabled {
            let backoff = RetryPolicy::from_config(&self.retry).without_jitter();
            let waits: Duration = (0..self.retry.max_attempts.saturating_sub(1)).map(|i| backoff.delay(i)).sum();
            Duration::from_secs(self.backend.timeout_secs).saturating_mul(self.retry.max_attempts) + waits
        } else {
            Duration::ZERO
        };
        consult + Duration::from_secs(self.execution.timeout_secs)
    }

    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        if self.agent.interval_secs == 0 {
            return Err(ConfigError::Invalid("agent.interval_secs must be positive".into()));
        }

        for (name, value) in [
            ("cpu_percent", self.thresholds.cpu_percent),
            ("memory_percent", self.thresholds.memory_percent),
            ("disk_percent", self.thresholds.disk_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{name} must be within (0, 100], got {value}"
                )));
            }
            if value > 90.0 {
                warnings.push(format!("thresholds.{name} is set very high ({value}%)"));
            }
        }
        if self.thresholds.network_connections == 0 {
            return Err(ConfigError::Invalid("thresholds.network_connections must be positive".into()));
        }

        let order = &self.decision.priority_order;
        if order.is_empty() {
            return Err(ConfigError::Invalid("decision.priority_order cannot be empty".into()));
        }
        for (i, resource) in order.iter().enumerate() {
            if order[..i].contains(resource) {
                return Err(ConfigError::Invalid(format!(
                    "decision.priority_order lists {resource} twice"
                )));
            }
        }
        if order.len() < 4 {
            warnings.push("decision.priority_order omits some resources; their breaches are ignored".into());
        }
        if self.decision.trend_window < 2 {
            return Err(ConfigError::Invalid("decision.trend_window must be at least 2".into()));
        }

        if self.memory.short_term_capacity == 0 {
            return Err(ConfigError::Invalid("memory.short_term_capacity must be positive".into()));
        }
        if self.memory.summary_bucket_secs <= 0 || self.memory.retention_days <= 0 {
            return Err(ConfigError::Invalid(
                "memory.summary_bucket_secs and memory.retention_days must be positive".into(),
            ));
        }
        if self.memory.persist_attempts == 0 {
            return Err(ConfigError::Invalid("memory.persist_attempts must be at least 1".into()));
        }
        if self.memory.durable_priority < self.memory.persist_priority {
            warnings.push("memory.durable_priority is below memory.persist_priority".into());
        }

        if self.security.whitelist.is_empty() {
            warnings.push("security.whitelist is empty; every command will be rejected".into());
        }
        for pattern in &self.security.blacklist {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("security.blacklist pattern {pattern:?}: {e}"))
            })?;
        }
        if !(0.0..=1.0).contains(&self.security.risk_ceiling) {
            return Err(ConfigError::Invalid("security.risk_ceiling must be within [0, 1]".into()));
        }

        if self.execution.timeout_secs == 0 || self.execution.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "execution.timeout_secs and execution.max_output_bytes must be positive".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.backend.enabled && self.backend.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.endpoint is required when the backend is enabled".into()));
        }

        if self.supervisor.missed_heartbeats_before_restart == 0 || self.supervisor.staleness_secs <= 0 {
            return Err(ConfigError::Invalid(
                "supervisor.missed_heartbeats_before_restart and supervisor.staleness_secs must be positive".into(),
            ));
        }
        // Heartbeats are written between cycles, so the gap is the longer of the two
        let beat_gap = self.slowest_cycle().max(self.agent.interval());
        if Duration::from_secs(self.supervisor.staleness_secs as u64) < beat_gap {
            warnings.push(format!(
                "supervisor.staleness_secs ({}) is shorter than the longest heartbeat gap ({}s: interval {}s, \
                 backend {}s x {} attempts plus backoff, command {}s); the watchdog may restart a healthy agent",
                self.supervisor.staleness_secs,
                beat_gap.as_secs_f64().ceil(),
                self.agent.interval_secs,
                self.backend.timeout_secs,
                self.retry.max_attempts,
                self.execution.timeout_secs,
            ));
        }

        Ok(warnings)
    }
}
