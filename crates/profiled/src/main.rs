//! Profiled binary entry point.
//!
//! Starts the ingestion HTTP server, the rotation task and the uploader, and on
//! shutdown flushes the current window before waiting for outstanding uploads.

use std::sync::Arc;

use profiled::{
    ingest::{ingest_router_with_limit, IngestState},
    start_rotation, HttpPublisher, ProfileStore, ProfiledConfig, ProfiledError, Uploader,
};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging starts on the default filter so configuration errors are reported; the
    // configured filter replaces it once loaded unless RUST_LOG is set.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let (filter, filter_handle) = reload::Layer::new(
        env_filter.unwrap_or_else(|| ProfiledConfig::default().default_log_filter().into()),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting profiled");

    let config = load_config(ProfiledConfig::load)?;
    if !from_env {
        filter_handle.reload(EnvFilter::new(config.default_log_filter()))?;
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }
    tracing::info!(
        http_addr = %config.server.http_addr,
        org_id = %config.profile.org_id,
        rotation_interval_secs = config.profile.rotation_interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(ProfileStore::new());
    let publisher = Arc::new(HttpPublisher::from_config(&config.upload)?);
    tracing::info!(url = publisher.url(), "Publisher created");

    let uploader = Arc::new(Uploader::new(
        publisher,
        config.upload.retry_policy(),
        config.upload.max_concurrent_uploads,
    ));
    let rotation = start_rotation(
        store.clone(),
        uploader.clone(),
        config.profile.rotation_interval(),
    );

    let state = IngestState {
        store,
        uploader: uploader.clone(),
        profile: Arc::new(config.profile.clone()),
    };
    let router = ingest_router_with_limit(state, config.server.max_body_size);

    let http_addr = config.server.http_addr;
    let listener = match tokio::net::TcpListener::bind(http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %http_addr, error = %e, "Failed to bind HTTP listener");
            rotation.abort();
            return Err(e.into());
        }
    };

    tracing::info!(http = %http_addr, "Server starting");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "HTTP server error");
    }

    tracing::info!("Flushing current window");
    rotation.shutdown().await;

    let abandoned = uploader.shutdown(config.shutdown.upload_timeout()).await;
    let stats = uploader.stats();
    tracing::info!(
        delivered = stats.delivered(),
        rejected = stats.rejected(),
        exhausted = stats.exhausted(),
        abandoned,
        "Shutdown complete"
    );
    Ok(())
}

/// Loads configuration, logging the failure before it is returned.
fn load_config(
    load: impl FnOnce() -> Result<ProfiledConfig, ProfiledError>,
) -> Result<ProfiledConfig, ProfiledError> {
    load().inspect_err(|e| tracing::error!(error = %e, "Failed to load configuration"))
}

/// Create a shutdown signal future for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
