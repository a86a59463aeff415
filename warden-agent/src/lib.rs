//! Warden Agent - autonomous host monitoring main loop
//!
//! One cycle runs collect → decide → validate → execute → record:
//! - Metrics sampling with soft failure handling
//! - Threshold rules first, reasoning backend consult for trends and anomalies
//! - Command policy gate before anything reaches the sandboxed executor
//! - Two-tier memory store (short-term buffer, append-only long-term log)
//! - Heartbeat and PID files observed by the external watchdog

pub mod agent;
pub mod backend;
pub mod config;
pub mod decision;
pub mod execution;
pub mod exit_code;
pub mod heartbeat;
pub mod integrity;
pub mod lifecycle;
pub mod lockfile;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;
