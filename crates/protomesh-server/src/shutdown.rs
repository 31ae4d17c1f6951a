//! Graceful shutdown handling for the protomesh server

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Broadcast shutdown signal shared by every background task
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Trigger `signal` on Ctrl+C or SIGTERM
pub fn shutdown_on_signals(signal: &ShutdownSignal) {
    let signal = signal.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate() => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
        signal.shutdown();
    });
}

/// Wait for background tasks to finish, aborting whatever outlives `timeout`
pub async fn drain(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
    let joined = join_all(handles);
    if tokio::time::timeout(timeout, joined).await.is_err() {
        warn!(timeout_ms = timeout.as_millis() as u64, "Tasks still running at shutdown deadline, aborting");
        for abort in aborts {
            abort.abort();
        }
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await
            && e.is_panic()
        {
            error!(error = %e, "Background task panicked");
        }
    }
}
