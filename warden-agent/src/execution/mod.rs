//! Sandboxed command execution
//!
//! Runs an approved command:
//! - Directly, without a shell, from its shell-words tokens
//! - With a cleared environment (fixed PATH, C locale)
//! - In its own process group, so a timeout kills the whole tree
//! - Under RLIMIT_AS / RLIMIT_CPU ceilings and a nice level
//! - With stdout and stderr capped and flagged when truncated
//!
//! Non-zero exits and timeouts are results, never errors. Only transient
//! spawn failures (EAGAIN, EINTR, EBUSY) are retried.

use crate::config::{ExecutionConfig, RetryConfig};
use crate::memory::{TaskRecord, TaskStatus};
use crate::retry::{RetryPolicy, Retryable};
use crate::validator::ValidationVerdict;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// Minimum wait for the pipes to drain after the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error, PartialEq)]
pub enum ExecutionError {
    #[error("verdict does not approve execution: {0}")]
    NotApproved(String),
    #[error("verdict from cycle {verdict_cycle} cannot be used in cycle {cycle}")]
    StaleVerdict { verdict_cycle: u64, cycle: u64 },
    #[error("approved command does not tokenize: {0}")]
    InvalidCommand(String),
}

/// Command execution result
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub command: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn to_task_record(&self, cycle: u64) -> TaskRecord {
        TaskRecord {
            id: self.task_id,
            task_type: "command".to_string(),
            status: self.status,
            duration_ms: self.duration_ms,
            cycle,
            command: self.command.clone(),
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            truncated: self.truncated,
        }
    }
}

#[derive(Debug)]
struct SpawnError(std::io::Error);

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "spawn failed: {}", self.0)
    }
}

impl Retryable for SpawnError {
    fn is_retryable(&self) -> bool {
        matches!(
            self.0.raw_os_error().map(Errno::from_i32),
            Some(Errno::EAGAIN | Errno::EINTR | Errno::EBUSY)
        )
    }
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct SandboxedExecutor {
    timeout: Duration,
    memory_limit_bytes: u64,
    cpu_time_secs: u64,
    nice: i32,
    max_output_bytes: usize,
    spawn_retry: RetryPolicy,
}

impl SandboxedExecutor {
    pub fn new(config: &ExecutionConfig, retry: &RetryConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            memory_limit_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
            cpu_time_secs: config.cpu_time_secs,
            nice: config.nice,
            max_output_bytes: config.max_output_bytes,
            spawn_retry: RetryPolicy::from_config(retry),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute the command an allowed verdict from this same cycle approved
    pub async fn execute(
        &self,
        verdict: &ValidationVerdict,
        cycle: u64,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if !verdict.allowed() {
            return Err(ExecutionError::NotApproved(verdict.reason().to_string()));
        }
        if verdict.cycle() != cycle {
            return Err(ExecutionError::StaleVerdict {
                verdict_cycle: verdict.cycle(),
                cycle,
            });
        }
        let argv = shell_words::split(verdict.sanitized_command())
            .map_err(|e| ExecutionError::InvalidCommand(e.to_string()))?;
        if argv.is_empty() {
            return Err(ExecutionError::InvalidCommand("empty command".into()));
        }

        let task_id = Uuid::new_v4();
        let command = verdict.sanitized_command().to_string();
        let started = Instant::now();
        info!(task = %task_id, cycle, command = %command, "executing command");

        let spawned = self
            .spawn_retry
            .run("spawn command", cancel, || std::future::ready(self.spawn(&argv)))
            .await;
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(task = %task_id, error = %e, "command did not start");
                return Ok(ExecutionResult {
                    task_id,
                    command,
                    status: TaskStatus::SpawnFailed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    truncated: false,
                    timed_out: false,
                });
            }
        };

        let group = child.id();
        let stdout = child.stdout.take().map(|out| OutputReader::spawn(out, self.max_output_bytes));
        let stderr = child.stderr.take().map(|err| OutputReader::spawn(err, self.max_output_bytes));

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = tokio::time::sleep(self.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };
        if !matches!(exit, Exit::Status(_)) {
            kill_group(&mut child).await;
        }

        // A background process left in the group can hold the pipes open past the exit
        let drain_until = (started + self.timeout).max(Instant::now() + DRAIN_GRACE);
        let (stdout, out_truncated, out_abandoned) = collect(stdout, drain_until).await;
        let (stderr, err_truncated, err_abandoned) = collect(stderr, drain_until).await;
        if out_abandoned || err_abandoned {
            warn!(task = %task_id, "output still open at the deadline, killing leftover processes");
            if let Some(pgid) = group {
                if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                    debug!(pgid, error = %e, "no leftover process group");
                }
            }
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, exit_code, timed_out) = match exit {
            Exit::Status(Ok(status)) if status.success() => (TaskStatus::Succeeded, status.code(), false),
            Exit::Status(Ok(status)) => (TaskStatus::Failed, status.code(), false),
            Exit::Status(Err(e)) => {
                warn!(task = %task_id, error = %e, "lost track of command");
                (TaskStatus::Failed, None, false)
            }
            Exit::TimedOut => {
                warn!(task = %task_id, timeout = ?self.timeout, "command timed out, process group killed");
                (TaskStatus::TimedOut, None, true)
            }
            Exit::Cancelled => (TaskStatus::Cancelled, None, false),
        };

        info!(task = %task_id, ?status, ?exit_code, duration_ms, "command finished");
        Ok(ExecutionResult {
            task_id,
            command,
            status,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            truncated: out_truncated || err_truncated || out_abandoned || err_abandoned,
            timed_out,
        })
    }

    fn spawn(&self, argv: &[String]) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let (memory, cpu, nice) = (self.memory_limit_bytes, self.cpu_time_secs, self.nice);
        // SAFETY: only async-signal-safe calls (setrlimit, nice) run between fork and exec
        unsafe {
            cmd.pre_exec(move || apply_limits(memory, cpu, nice));
        }
        cmd.spawn().map_err(SpawnError)
    }
}

fn apply_limits(memory_bytes: u64, cpu_secs: u64, nice: i32) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if memory_bytes > 0 {
        setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)?;
    }
    if cpu_secs > 0 {
        setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;
    }
    if nice != 0 {
        // -1 is a legal return value, errors are not distinguishable here
        unsafe {
            nix::libc::nice(nice);
        }
    }
    Ok(())
}

async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "killpg failed, killing child only");
            let _ = child.start_kill();
        }
    }
    // Reap so no zombie outlives the cycle
    let _ = child.wait().await;
}

/// Bytes read so far and whether the cap cut any off
type Captured = Arc<Mutex<(Vec<u8>, bool)>>;

/// Drains one pipe in the background; what it read survives an abort
struct OutputReader {
    captured: Captured,
    handle: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(reader: R, cap: usize) -> Self {
        let captured = Captured::default();
        let handle = tokio::spawn(read_capped(reader, cap, captured.clone()));
        Self { captured, handle }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize, captured: Captured) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut guard = captured.lock();
                let (buf, truncated) = &mut *guard;
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    buf.extend_from_slice(&chunk[..room]);
                    *truncated = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// Output, truncated flag, and whether the pipe was still open at `deadline`
async fn collect(reader: Option<OutputReader>, deadline: Instant) -> (String, bool, bool) {
    let Some(OutputReader { captured, mut handle }) = reader else {
        return (String::new(), false, false);
    };
    let abandoned = match tokio::time::timeout(deadline.saturating_duration_since(Instant::now()), &mut handle).await {
        Ok(_) => false,
        Err(_) => {
            handle.abort();
            true
        }
    };
    let (bytes, truncated) = std::mem::take(&mut *captured.lock());
    (String::from_utf8_lossy(&bytes).into_owned(), truncated, abandoned)
}
