//! Metrics HTTP endpoint commands.

use std::net::SocketAddr;
use std::sync::Arc;

use skopeo_wrapper::metrics::MetricsRegistry;
use skopeo_wrapper::server;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::CliError;

/// Serve `/metrics` and `/health` until Ctrl-C.
pub async fn run(metrics: Option<Arc<MetricsRegistry>>, addr: SocketAddr) -> Result<(), CliError> {
    let metrics = metrics.ok_or_else(|| {
        CliError::InvalidArgument("the metrics server needs metrics enabled".to_string())
    })?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    println!("Serving metrics on http://{}/metrics (Ctrl-C to stop)", addr);
    server::serve(metrics, addr, shutdown).await?;
    Ok(())
}

/// Metrics server running alongside a single command.
pub struct BackgroundServer {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), server::ServerError>>,
}

impl BackgroundServer {
    pub fn start(metrics: Arc<MetricsRegistry>, addr: SocketAddr) -> Self {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server::serve(metrics, addr, shutdown.clone()));
        Self { shutdown, handle }
    }

    /// Stop serving and wait for the listener to close.
    pub async fn stop(self) {
        self.shutdown.cancel();
        match self.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "metrics server failed"),
            Err(e) => warn!(error = %e, "metrics server task panicked"),
        }
    }
}
