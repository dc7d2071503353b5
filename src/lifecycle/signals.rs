//! OS signal handling.
//!
//! The first SIGINT or SIGTERM starts a graceful shutdown. A second one means
//! the operator has run out of patience and the process exits immediately.

use crate::lifecycle::shutdown::Shutdown;

/// Exit status used when a second signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Resolve on the next SIGINT or SIGTERM.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Translate signals into shutdown, forever.
pub async fn watch_signals(shutdown: Shutdown) {
    loop {
        termination_signal().await;
        if shutdown.trigger() {
            tracing::info!("Shutdown signal received, draining connections");
        } else {
            tracing::warn!("Second shutdown signal received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
    }
}
