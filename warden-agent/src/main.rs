//! `warden` - autonomous host monitoring agent

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use warden_agent::agent::{Agent, AgentError};
use warden_agent::config::{Config, ConfigError};
use warden_agent::heartbeat::{PidFile, StateFileError};
use warden_agent::lifecycle::Lifecycle;
use warden_agent::memory::{EntryType, MemoryQuery, MemoryStore, PersistenceError};
use warden_agent::metrics::{Collector, SysinfoProbe};
use warden_agent::{exit_code, logging};

/// Watches the host, proposes fixes, runs only what the command policy allows.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Configuration file (overrides WARDEN_CONFIG and the default location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the autonomous monitoring loop until SIGTERM/SIGINT.
    Run,

    /// Print one metric sample as JSON.
    Monitor,

    /// Print memory entries as JSON lines, newest first.
    Query {
        /// metric, decision, command_result or security_event
        #[arg(long = "type")]
        entry_type: Option<EntryType>,
        /// Only entries at or above this priority.
        #[arg(long)]
        min_priority: Option<u8>,
        /// Maximum number of entries.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate and run a single command outside the loop.
    Exec {
        /// Command line, quoted as one argument.
        command: String,
    },

    /// Run one memory compaction pass.
    Compact,

    /// Validate the configuration and print warnings.
    CheckConfig,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "warden failed");
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load_from(cli.config.as_deref())?;

    if let Commands::CheckConfig = cli.command {
        return check_config(&config);
    }

    logging::init(&config.logging);
    for warning in config.validate()? {
        warn!(%warning, "configuration warning");
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Run => run_agent(config).await,
            Commands::Monitor => {
                let sample = Collector::new(Box::new(SysinfoProbe::new())).sample();
                println!("{}", serde_json::to_string_pretty(&sample)?);
                Ok(exit_code::OK)
            }
            Commands::Query {
                entry_type,
                min_priority,
                limit,
            } => {
                let store = MemoryStore::open(&config.agent.memory_log(), config.memory.clone())?;
                let query = MemoryQuery {
                    entry_type,
                    min_priority,
                    limit,
                    ..Default::default()
                };
                for entry in store.query(&query) {
                    println!("{}", serde_json::to_string(&entry)?);
                }
                Ok(exit_code::OK)
            }
            Commands::Exec { command } => {
                let mut agent = Agent::new(config, Box::new(SysinfoProbe::new()), None, Lifecycle::new())?;
                let (verdict, result) = agent.exec_once(&command).await?;
                let Some(result) = result else {
                    println!("success: false");
                    println!("rejected: {}", verdict.reason());
                    return Ok(exit_code::FAILURE);
                };
                println!("success: {}", result.success());
                if let Some(code) = result.exit_code {
                    println!("exit code: {code}");
                }
                print!("{}", result.stdout);
                if !result.stderr.is_empty() {
                    eprint!("{}", result.stderr);
                }
                Ok(if result.success() { exit_code::OK } else { exit_code::FAILURE })
            }
            Commands::Compact => {
                let store = MemoryStore::open(&config.agent.memory_log(), config.memory.clone())?;
                let report = store.compact()?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(exit_code::OK)
            }
            Commands::CheckConfig => check_config(&config),
        }
    })
}

fn check_config(config: &Config) -> Result<i32> {
    match &config.source_path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: built-in defaults"),
    }
    match config.validate() {
        Ok(warnings) if warnings.is_empty() => {
            println!("ok");
            Ok(exit_code::OK)
        }
        Ok(warnings) => {
            for warning in warnings {
                println!("warning: {warning}");
            }
            Ok(exit_code::OK)
        }
        Err(e) => {
            println!("invalid: {e}");
            Ok(exit_code::CONFIG_INVALID)
        }
    }
}

async fn run_agent(config: Config) -> Result<i32> {
    let _pid = PidFile::acquire(&config.agent.pid_file())?;

    let lifecycle = Lifecycle::new();
    let signals = lifecycle
        .spawn_signal_listener()
        .context("failed to install signal handlers")?;

    let mut agent = Agent::from_config(config, lifecycle.clone())?;
    if let Ok(recovery_ref) = std::env::var("WARDEN_RECOVERY_REF") {
        agent.resume(&recovery_ref)?;
    }

    info!(pid = std::process::id(), "warden starting");
    let outcome = agent.run().await;
    lifecycle.shutdown();
    let _ = signals.await;
    outcome?;
    info!("warden stopped");
    Ok(exit_code::OK)
}

/// Map the first typed error in the chain to its exit code
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<AgentError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::CONFIG_INVALID;
        }
        if let Some(e) = cause.downcast_ref::<StateFileError>() {
            return match e {
                StateFileError::AlreadyRunning { .. } => exit_code::ALREADY_RUNNING,
                _ => exit_code::FAILURE,
            };
        }
        if cause.downcast_ref::<PersistenceError>().is_some() {
            return exit_code::PERSISTENCE_FAILURE;
        }
    }
    exit_code::FAILURE
}
