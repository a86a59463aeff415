//! `warden-watchdog` - restarts the warden main loop when it dies or stops beating
//!
//! Talks to the main loop only through files under the state directory:
//! `warden.pid`, `heartbeat.json` and its own `supervisor.json` checkpoint.

mod checkpoint;
mod process;
mod supervisor;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use warden_agent::config::{Config, ConfigError};
use warden_agent::heartbeat::{PidFile, StateFileError};
use warden_agent::lifecycle::Lifecycle;
use warden_agent::{exit_code, logging};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::process::{ChildController, FileHeartbeat};
use crate::supervisor::{PollOutcome, Supervisor};

/// Supervises `warden run`, escalating to an operator after a restart storm.
#[derive(Parser)]
#[command(name = "warden-watchdog", version, about)]
struct Cli {
    /// Configuration file passed through to the main loop
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch and supervise the main loop until SIGTERM/SIGINT.
    Run,

    /// Print the supervisor checkpoint as JSON.
    Status,

    /// Clear a pending escalation and the restart history.
    Reset,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "warden-watchdog failed");
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load_from(cli.config.as_deref())?;
    logging::init(&config.logging);
    for warning in config.validate()? {
        warn!(%warning, "configuration warning");
    }

    let store = CheckpointStore::new(&config.agent.checkpoint_file());
    match cli.command {
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            runtime.block_on(supervise(config, store))
        }
        Commands::Status => {
            let state = store.load()?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(exit_code::OK)
        }
        Commands::Reset => {
            let state = store.reset()?;
            println!("escalation cleared, checkpoint at {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(exit_code::OK)
        }
    }
}

async fn supervise(config: Config, store: CheckpointStore) -> Result<i32> {
    let _pid = PidFile::acquire(&config.agent.watchdog_pid_file())?;

    let lifecycle = Lifecycle::new();
    let signals = lifecycle
        .spawn_signal_listener()
        .context("failed to install signal handlers")?;
    let cancel = lifecycle.token();

    let binary = ChildController::resolve_binary(config.supervisor.agent_binary.as_deref())?;
    info!(binary = %binary.display(), "supervising main loop");
    let controller = ChildController::new(binary, config.source_path.clone());
    let heartbeat = FileHeartbeat::new(config.agent.heartbeat_file());
    let poll_every = Duration::from_secs(config.supervisor.poll_interval_secs);
    let mut supervisor = Supervisor::new(config.supervisor.clone(), controller, heartbeat, store)?;

    lifecycle.mark_running();
    // Termination waits out the grace period; keep it off the async workers
    let mut outcome = tokio::task::block_in_place(|| supervisor.start(Utc::now()))?;
    while outcome != PollOutcome::Escalated {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_every) => {}
        }
        outcome = tokio::task::block_in_place(|| supervisor.poll(Utc::now()))?;
    }

    lifecycle.shutdown();
    let _ = signals.await;
    lifecycle.mark_stopped();

    if outcome == PollOutcome::Escalated {
        error!("main loop restart ceiling reached, operator action required");
        return Ok(exit_code::ESCALATION_REQUIRED);
    }
    // The main loop keeps running; the next watchdog adopts it from the checkpoint
    info!(
        phase = ?supervisor.phase(),
        failures = supervisor.state().consecutive_failure_count,
        "watchdog stopped"
    );
    Ok(exit_code::OK)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::CONFIG_INVALID;
        }
        if let Some(StateFileError::AlreadyRunning { .. }) = cause.downcast_ref::<StateFileError>() {
            return exit_code::ALREADY_RUNNING;
        }
        if cause.downcast_ref::<CheckpointError>().is_some() {
            return exit_code::PERSISTENCE_FAILURE;
        }
    }
    exit_code::FAILURE
}
