//! Shutdown coordination for background sync loops
//!
//! Loops obtain a [`ShutdownListener`] and select on it next to their timers.
//! The owner registers each spawned task so `shutdown()` can wait for them.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of the coordinated tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Broadcasts a single shutdown edge and joins registered tasks
pub struct ShutdownCoordinator {
    state_tx: watch::Sender<ShutdownState>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// `timeout` bounds how long `shutdown()` waits for each registered task
    pub fn new(timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Self { state_tx, tasks: Mutex::new(Vec::new()), timeout }
    }

    /// Handle a loop can await to learn that shutdown started
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener { rx: self.state_tx.subscribe() }
    }

    /// Track a spawned task so shutdown can join it
    pub fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push((name, handle));
    }

    /// Current state
    pub fn state(&self) -> ShutdownState {
        *self.state_tx.borrow()
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Signal every listener, then wait for registered tasks
    ///
    /// Tasks that do not finish within the timeout are aborted.
    pub async fn shutdown(&self) {
        if self.is_shutting_down() {
            debug!("Shutdown already requested");
            return;
        }
        info!("Initiating shutdown");
        self.state_tx.send_replace(ShutdownState::ShuttingDown);

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };

        for (name, mut handle) in tasks {
            match tokio::time::timeout(self.timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!(task = name, "Task was cancelled"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, timeout = ?self.timeout, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.state_tx.send_replace(ShutdownState::Shutdown);
        info!("Shutdown complete");
    }
}

/// Receives the shutdown edge
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<ShutdownState>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been requested (or the coordinator dropped)
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|s| *s != ShutdownState::Running).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() != ShutdownState::Running
    }
}
