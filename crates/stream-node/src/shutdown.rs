//! Turns termination signals into a registry shutdown.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::registry::{ShutdownReport, StreamRegistry};

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Run [`StreamRegistry::shutdown_all`] without blocking the runtime.
pub async fn shutdown_registry(registry: Arc<StreamRegistry>, timeout: Duration) -> anyhow::Result<ShutdownReport> {
    tokio::task::spawn_blocking(move || registry.shutdown_all(timeout))
        .await
        .context("registry shutdown task failed")
}
