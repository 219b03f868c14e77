use std::future::Future;
use tracing::{error, info};

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    until_signalled(tokio::signal::ctrl_c()).await
}

/// Resolves once `signal` fires. If the signal handler cannot be installed, logs the error and
/// never resolves, so the process keeps running instead of shutting down at once.
pub async fn until_signalled(signal: impl Future<Output = std::io::Result<()>>) {
    match signal.await {
        Ok(()) => info!("Shutting down"),
        Err(error) => {
            error!("Unable to listen for shutdown signal: {error}");
            std::future::pending::<()>().await
        }
    }
}
