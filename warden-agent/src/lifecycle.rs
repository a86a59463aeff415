//! Process lifecycle: state tracking plus cooperative shutdown

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Shared between the main loop and the signal listener
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<Mutex<LifecycleState>>,
    cancel: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState::Starting)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Starting {
            *state = LifecycleState::Running;
        }
    }

    /// Request shutdown; in-flight work observes the token
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, LifecycleState::Starting | LifecycleState::Running) {
                *state = LifecycleState::ShuttingDown;
            }
        }
        self.cancel.cancel();
    }

    pub fn mark_stopped(&self) {
        *self.state.lock() = LifecycleState::Stopped;
    }

    /// Turn SIGTERM / SIGINT into a shutdown request
    pub fn spawn_signal_listener(&self) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let lifecycle = self.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
                _ = lifecycle.cancel.cancelled() => return,
            }
            warn!("shutting down after the current cycle");
            lifecycle.shutdown();
        }))
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
