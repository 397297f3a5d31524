//! Dedicated I/O thread driving a facade's asynchronous completions.
//!
//! Each [`TcpClient`](crate::TcpClient) and [`TcpServer`](crate::TcpServer)
//! owns one [`EventLoopRunner`]. Starting it spawns a named worker thread that
//! builds a current-thread Tokio runtime and parks on a shutdown receiver.
//! That pending receiver is the keep-alive token: the runtime keeps servicing
//! I/O even while no operation is outstanding, for example between a
//! completed connect and the first byte arriving.
//!
//! Stopping releases the token and joins the thread. The runtime is dropped on
//! the worker thread, which cancels every task still pending on it (reads,
//! writes, accepts, connects). A stopped runner is never restarted; the
//! facades create a fresh one on their next connect or accept.

use std::thread::JoinHandle;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::{NetworkError, Result};
use crate::logging::targets;

/// Configuration for the event loop thread.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            thread_name: "horizon-tcp-io".to_string(),
        }
    }
}

impl EventLoopConfig {
    /// Set the worker thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// State held while the worker thread is alive.
struct Running {
    handle: Handle,
    shutdown_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

enum RunnerState {
    Idle,
    Running(Running),
    Stopped,
}

/// Owns the I/O runtime and its worker thread for one facade instance.
pub struct EventLoopRunner {
    config: EventLoopConfig,
    state: RunnerState,
}

impl EventLoopRunner {
    /// Create a runner that has not been started yet.
    pub fn new(config: EventLoopConfig) -> Self {
        Self {
            config,
            state: RunnerState::Idle,
        }
    }

    /// Start the worker thread if it is not already running.
    ///
    /// Returns the runtime handle used to spawn I/O tasks. Calling this on a
    /// running runner returns the existing handle; calling it on a stopped
    /// runner is an error.
    pub fn start(&mut self) -> Result<&Handle> {
        if matches!(self.state, RunnerState::Stopped) {
            return Err(NetworkError::Runtime(
                "event loop has already been stopped".to_string(),
            ));
        }

        if matches!(self.state, RunnerState::Idle) {
            let running = Self::spawn_worker(&self.config)?;
            tracing::debug!(
                target: targets::RUNNER,
                "Event loop '{}' started",
                self.config.thread_name
            );
            self.state = RunnerState::Running(running);
        }

        self.handle()
            .ok_or_else(|| NetworkError::Runtime("event loop is not running".to_string()))
    }

    fn spawn_worker(config: &EventLoopConfig) -> Result<Running> {
        // Channel to send the handle back from the spawned thread
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_io().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime here cancels every task still pending.
            })
            .map_err(|e| NetworkError::Runtime(e.to_string()))?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(NetworkError::Runtime(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(NetworkError::Runtime(
                    "event loop thread exited before reporting its handle".to_string(),
                ));
            }
        };

        Ok(Running {
            handle,
            shutdown_tx,
            thread,
        })
    }

    /// Stop the worker thread and wait for it to exit.
    ///
    /// Blocks until every pending task has been cancelled. Idempotent.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, RunnerState::Stopped) {
            RunnerState::Running(running) => {
                let _ = running.shutdown_tx.send(());
                if running.thread.join().is_err() {
                    tracing::error!(
                        target: targets::RUNNER,
                        "Event loop '{}' panicked",
                        self.config.thread_name
                    );
                }
                tracing::debug!(
                    target: targets::RUNNER,
                    "Event loop '{}' stopped",
                    self.config.thread_name
                );
            }
            RunnerState::Idle => self.state = RunnerState::Idle,
            RunnerState::Stopped => {}
        }
    }

    /// Check if the worker thread is alive.
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunnerState::Running(_))
    }

    /// Get the runtime handle, if running.
    pub fn handle(&self) -> Option<&Handle> {
        match &self.state {
            RunnerState::Running(running) => Some(&running.handle),
            _ => None,
        }
    }
}

impl Drop for EventLoopRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventLoopRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopRunner")
            .field("thread_name", &self.config.thread_name)
            .field("running", &self.is_running())
            .finish()
    }
}
