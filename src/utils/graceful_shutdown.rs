use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio::{signal, sync::broadcast};
use tokio_util::sync::CancellationToken;

/// Why the process is going down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Requested from inside the process
    Requested,
}

/// Turns OS signals into one broadcast reason plus a cancellation token.
///
/// The token is what the listener and background tasks observe; the
/// broadcast channel only carries the reason for logging.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    token: CancellationToken,
    /// How long in-flight connections get once the listener stops
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a manager with the default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_drain_timeout(Duration::from_secs(30))
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown; later calls are ignored.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring signal");
            return;
        }
        tracing::info!(?reason, "initiating graceful shutdown");
        // no subscribers is fine, the token carries the signal
        let _ = self.shutdown_tx.send(reason);
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        let reason = tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                ShutdownReason::Interrupt
            }
            result = wait_for_sigterm() => {
                result?;
                ShutdownReason::Terminate
            }
            () = self.token.cancelled() => return Ok(()),
        };

        self.trigger_shutdown(reason);
        Ok(())
    }

    /// Resolve once shutdown starts, with its reason.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        tokio::select! {
            reason = receiver.recv() => reason.unwrap_or(ShutdownReason::Requested),
            () = self.token.cancelled() => ShutdownReason::Requested,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
