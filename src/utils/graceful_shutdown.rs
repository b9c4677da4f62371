//! Graceful shutdown coordination.
//!
//! A broadcast channel plus an atomic latch: the signal handler (or a manual
//! trigger) flips the latch and fans the signal out to every subscribed
//! [`ShutdownToken`]. Background tasks select on their token; the supervisor
//! awaits their handles so no task is abandoned mid-sweep.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

/// Shutdown fan-out for the gateway process.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether shutdown has been initiated.
    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    /// Create a token that resolves when shutdown starts.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.shutdown_tx.subscribe(),
            initiated: self.initiated.clone(),
        }
    }

    /// Initiate shutdown. Idempotent; only the first call fans out.
    pub fn trigger(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("shutdown initiated");
            let _ = self.shutdown_tx.send(());
        } else {
            tracing::debug!("shutdown already initiated, ignoring");
        }
    }

    /// Listen for SIGINT / SIGTERM and initiate shutdown on the first one.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
        }
        self.trigger();
        Ok(())
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}

/// A per-task handle onto the shutdown signal.
pub struct ShutdownToken {
    receiver: broadcast::Receiver<()>,
    initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            initiated: self.initiated.clone(),
        }
    }
}

impl ShutdownToken {
    /// Whether shutdown has been initiated.
    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    /// Resolve once shutdown is initiated. Returns immediately if it already
    /// was (the latch is checked before waiting on the channel, so tokens
    /// cloned after the trigger do not block forever).
    pub async fn wait(&mut self) {
        if self.is_initiated() {
            return;
        }
        let _ = self.receiver.recv().await;
    }
}
