//! Process-wide shutdown signal.
//!
//! A single [`Shutdown`] is created at startup and cloned into every
//! component. Packet loops poll [`Shutdown::is_triggered`] once per packet;
//! async loops select on [`Shutdown::triggered`].

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Trigger shutdown on the first interrupt (Ctrl-C). A second interrupt
    /// exits immediately without waiting for in-flight work.
    pub fn listen_for_interrupt(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot listen for interrupt signal");
                return;
            }
            tracing::warn!("Caught interrupt: finishing current session, press Ctrl-C again to abort");
            shutdown.trigger();

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("Second interrupt: aborting");
                std::process::exit(130);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_visible_to_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        assert!(clone.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), clone.triggered())
            .await
            .expect("triggered() should resolve");
    }

    #[tokio::test]
    async fn test_triggered_waits() {
        let shutdown = Shutdown::new();
        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown.triggered()).await;
        assert!(waited.is_err());
    }
}
