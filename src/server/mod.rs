//! Process lifecycle coordinator.
//!
//! `Server` owns every long-running subsystem (the HTTP listener and each
//! event consumer), starts them as sibling tasks and drives one
//! deadline-bounded shutdown across all of them.
//!
//! Subsystems share a single stop token. A subsystem that fails is logged
//! under its own name and recorded in the status table; the others keep
//! running. Nothing is restarted.
//!
//! The broker handle, storage and tracer are not owned here. The process
//! entry point releases them after the done signal fires.

pub mod http;

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::EventConsumer;
pub use http::{HttpConfig, HttpServer};

/// Errors raised by the coordinator and the HTTP subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("Server already started")]
    AlreadyStarted,
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Last known state of one subsystem task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemStatus {
    Running,
    Stopped,
    Failed(String),
}

struct Subsystem {
    name: String,
    handle: JoinHandle<()>,
}

type StatusTable = Arc<RwLock<HashMap<String, SubsystemStatus>>>;

/// Lifecycle coordinator.
pub struct Server {
    state: Mutex<ServerState>,
    http: Mutex<Option<HttpServer>>,
    consumers: Vec<Arc<EventConsumer>>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<Subsystem>>,
    statuses: StatusTable,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Server {
    pub fn new(http: HttpServer, consumers: Vec<Arc<EventConsumer>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            state: Mutex::new(ServerState::Created),
            http: Mutex::new(Some(http)),
            consumers,
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    pub async fn state(&self) -> ServerState {
        *self.state.lock().await
    }

    /// Status of the subsystem named `name` ("http" or "consumer:<queue>").
    pub async fn subsystem_status(&self, name: &str) -> Option<SubsystemStatus> {
        self.statuses.read().await.get(name).cloned()
    }

    /// Receiver fired once shutdown has finished. Only the first caller gets it.
    pub async fn take_done_signal(&self) -> Option<oneshot::Receiver<()>> {
        self.done_rx.lock().await.take()
    }

    /// Start every subsystem on its own task and return without waiting for
    /// any of them to become ready.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        if *state != ServerState::Created {
            return Err(ServerError::AlreadyStarted);
        }

        let mut tasks = self.tasks.lock().await;

        if let Some(http) = self.http.lock().await.take() {
            let stop = self.stop_tx.subscribe();
            tasks.push(self.spawn_subsystem("http".to_string(), http.run(stop)).await);
        }

        for consumer in &self.consumers {
            let consumer = consumer.clone();
            let stop = self.stop_tx.subscribe();
            let name = format!("consumer:{}", consumer.queue());
            let task = async move { consumer.register(stop).await };
            tasks.push(self.spawn_subsystem(name, task).await);
        }

        *state = ServerState::Running;
        info!(subsystems = tasks.len(), "Server started");
        Ok(())
    }

    async fn spawn_subsystem<F, E>(&self, name: String, task: F) -> Subsystem
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.statuses
            .write()
            .await
            .insert(name.clone(), SubsystemStatus::Running);

        let statuses = self.statuses.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let status = match task.await {
                Ok(()) => {
                    debug!(subsystem = %task_name, "Subsystem exited");
                    SubsystemStatus::Stopped
                }
                Err(e) => {
                    error!(subsystem = %task_name, error = %e, "Subsystem failed");
                    SubsystemStatus::Failed(e.to_string())
                }
            };
            statuses.write().await.insert(task_name, status);
        });

        Subsystem { name, handle }
    }

    /// Stop every subsystem and wait at most `deadline` for them to finish.
    ///
    /// Subsystems still running at the deadline are aborted. The done signal
    /// fires exactly once, after the last subsystem is gone. Calls after the
    /// first return immediately.
    pub async fn graceful_stop(&self, deadline: Duration) {
        {
            let mut state = self.state.lock().await;
            match *state {
                ServerState::Running => *state = ServerState::ShuttingDown,
                ServerState::Created => {
                    *state = ServerState::Stopped;
                    drop(state);
                    info!("Server stopped before start");
                    self.signal_done().await;
                    return;
                }
                ServerState::ShuttingDown | ServerState::Stopped => {
                    debug!("Shutdown already in progress");
                    return;
                }
            }
        }

        info!(deadline = ?deadline, "Shutting down");
        self.stop_tx.send_replace(true);

        let deadline = Instant::now() + deadline;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for Subsystem { name, mut handle } in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(subsystem = %name, "Subsystem drained"),
                Ok(Err(e)) => error!(subsystem = %name, error = %e, "Subsystem task panicked"),
                Err(_) => {
                    warn!(subsystem = %name, "Subsystem missed shutdown deadline, aborting");
                    handle.abort();
                    self.statuses.write().await.insert(
                        name,
                        SubsystemStatus::Failed("shutdown deadline exceeded".to_string()),
                    );
                }
            }
        }

        *self.state.lock().await = ServerState::Stopped;
        info!("Server gracefully shut down");
        self.signal_done().await;
    }

    async fn signal_done(&self) {
        if let Some(done) = self.done_tx.lock().await.take() {
            // The receiver may already be gone; nothing else to notify.
            let _ = done.send(());
        }
    }
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
