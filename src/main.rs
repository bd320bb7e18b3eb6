use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use inference_gate::services::{InferenceBackend, UnavailableBackend, UpstreamBackend};
use inference_gate::{AppState, Config, build_router, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Inference Gate v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        api_keys_file = %config.api_keys_file.display(),
        denylist_file = %config.denylist_file.display(),
        "Configuration loaded"
    );

    // Prometheus exporter
    if let Some(metrics_addr) = config.metrics_addr() {
        inference_gate::metrics::try_init_metrics(metrics_addr);
    }

    // Inference backend
    let backend: Arc<dyn InferenceBackend> = match &config.inference_upstream_url {
        Some(url) => {
            let upstream = UpstreamBackend::new(url, config.model_id.clone()).map_err(|e| {
                error!("Failed to configure inference upstream: {e}");
                exitcode::CONFIG
            })?;
            info!(endpoint = %upstream.endpoint(), model = %config.model_id, "Inference upstream configured");
            Arc::new(upstream)
        }
        None => {
            warn!("INFERENCE_UPSTREAM_URL not set, chat completions will return 503");
            Arc::new(UnavailableBackend::new(config.model_id.clone()))
        }
    };

    // Build application state and router
    let state = AppState::new(config.clone(), backend);
    if state.gate.verifier().is_empty() {
        warn!("No API keys loaded, every protected route will return 401");
    }
    let app = build_router(state.clone());

    // Credential hot reload
    let reload_cancel = CancellationToken::new();
    let reload_task = tokio::spawn(utils::reload_credentials_on_hangup(
        state.gate.verifier().clone(),
        reload_cancel.clone(),
    ));

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health              - Model status (public)");
    info!("  POST /v1/chat/completions - Chat completion (scope chat:read)");
    info!("  GET  /metrics             - Request and abuse summary (scope *)");

    // Start server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    reload_cancel.cancel();
    if let Err(e) = reload_task.await {
        warn!("Credential reload task failed: {e}");
    }
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
