//! Shutdown signal handling for the daemon.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Error, Result};

/// Resolve on SIGINT, SIGTERM or SIGHUP (Ctrl-C elsewhere).
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Other(format!("SIGTERM handler failed: {e}")))?;
        let mut hup = signal(SignalKind::hangup())
            .map_err(|e| Error::Other(format!("SIGHUP handler failed: {e}")))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = term.recv() => info!("Received SIGTERM"),
            _ = hup.recv() => info!("Received SIGHUP"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Other(format!("Ctrl+C handler failed: {e}")))?;
        info!("Received Ctrl+C");
        Ok(())
    }
}

/// Cancel `token` when a shutdown signal arrives.
pub fn cancel_on_shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_shutdown_signal() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Signal handling unavailable");
                    return;
                }
                info!("Shutdown requested, draining workers");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_stays_live_until_signal_or_cancel() {
        let token = CancellationToken::new();
        cancel_on_shutdown_signal(token.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }
}
