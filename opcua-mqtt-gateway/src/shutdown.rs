//! Termination signal handling.

use std::io;
use tracing::info;

/// Registered before startup so a failing handler is a startup error, not a
/// gateway that can never be stopped cleanly.
#[cfg(unix)]
pub struct TerminationSignal {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignal {
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolves on SIGINT or SIGTERM.
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("caught interrupt signal"),
            _ = self.terminate.recv() => info!("caught termination signal"),
        }
    }
}

#[cfg(not(unix))]
pub struct TerminationSignal;

#[cfg(not(unix))]
impl TerminationSignal {
    pub fn install() -> io::Result<Self> {
        Ok(Self)
    }

    /// Resolves on Ctrl+C.
    pub async fn recv(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("caught interrupt signal"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C, shutting down"),
        }
    }
}
