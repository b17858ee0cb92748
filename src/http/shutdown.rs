//! Signal handling.
//!
//! Handles:
//! - SIGTERM/SIGINT: resolves the termination future that starts the drain
//! - SIGHUP: reloads the certificate from the store

use crate::tls::CertManager;

/// Resolves on Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires; the other one
/// still works.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Reload the certificate from the store on SIGHUP.
///
/// Lets an operator drop in a certificate record by hand without restarting.
#[cfg(unix)]
pub fn spawn_reload_handler(certs: CertManager) {
    tokio::spawn(async move {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

        while sighup.recv().await.is_some() {
            tracing::info!("Received SIGHUP, reloading certificate");

            match certs.reload_from_store().await {
                Ok(Some(not_after)) => {
                    tracing::info!(%not_after, "Certificate reloaded from store");
                }
                Ok(None) => {
                    tracing::warn!("No certificate in store, next handshake will issue one");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reload certificate");
                }
            }
        }
    });
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub fn spawn_reload_handler(_certs: CertManager) {
    tracing::warn!("Certificate reload via SIGHUP not supported on this platform");
}
