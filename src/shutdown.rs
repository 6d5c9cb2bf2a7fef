//! Graceful shutdown signal plumbing shared by the HTTP server and the
//! background tasks (health monitor, trace consumer, trace correlator).

use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Grace period given to in-flight HTTP handlers after shutdown is
/// requested, before the process exits regardless.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Resolves on SIGINT or SIGTERM (Unix) / Ctrl-C (other platforms).
pub async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received sigterm, shutting down"),
    }
}

/// Waits for a shutdown signal, then cancels `token` so every listener
/// (server, health monitor, trace pipeline) can wind down together.
pub async fn drive(token: CancellationToken) {
    wait_for_signal().await;
    token.cancel();
}
