pub mod logger;

use std::env;
use std::io;
use tokio::signal;
use tracing::info;

/// True when `name` is set to anything non-empty.
pub fn env_flag(name: &str) -> bool {
    env::var_os(name).is_some_and(|v| !v.is_empty())
}

/// SIGINT/SIGTERM listeners, registered when installed rather than when first
/// polled, so a signal arriving mid-run is never missed.
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
    #[cfg(unix)]
    interrupt: signal::unix::Signal,
}

impl ShutdownSignal {
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use signal::unix::{SignalKind, signal};
        Ok(ShutdownSignal {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(ShutdownSignal {})
    }

    /// Resolves on the next SIGINT or SIGTERM.
    #[cfg(unix)]
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("Received SIGINT, abandoning run"),
            _ = self.terminate.recv() => info!("Received SIGTERM, abandoning run"),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C, abandoning run");
    }
}
