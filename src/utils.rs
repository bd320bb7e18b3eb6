use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::services::credentials::CredentialVerifier;

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is a critical
/// initialization failure that should halt the application.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                panic!("Critical: cannot install Ctrl+C signal handler");
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                panic!("Critical: cannot install SIGTERM signal handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Reload the credential store on every SIGHUP until `cancel` fires.
///
/// Verification runs against the old table until the new one is swapped in.
/// On non-Unix platforms this only waits for cancellation.
pub async fn reload_credentials_on_hangup(
    verifier: Arc<CredentialVerifier>,
    cancel: CancellationToken,
) {
    #[cfg(unix)]
    {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Failed to install SIGHUP handler, credential reload disabled: {e}");
                cancel.cancelled().await;
                return;
            }
        };

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let credentials = verifier.reload();
                    info!(credentials, "Credential store reloaded on SIGHUP");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = verifier;
        cancel.cancelled().await;
    }
}
