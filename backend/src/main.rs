//! Terrareg - Main Entry Point

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use terrareg_backend::{
    api::{self, AppState},
    config::Config,
    db,
    error::Result,
    services::{command::ProcessCommandRunner, scheduler_service},
    storage::filesystem::FilesystemStorage,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let _otel_guard = telemetry::init_tracing(config.otel_endpoint.as_deref(), "terrareg")?;
    tracing::info!(config = ?config, "Starting Terrareg");

    let store = db::open_store(&config).await?;
    let storage = Arc::new(FilesystemStorage::new(
        Path::new(&config.data_directory).join("archives"),
    ));
    tracing::info!(data_directory = %config.data_directory, "Archive storage initialized");

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = Arc::new(AppState::new(
        config,
        store.clone(),
        storage,
        Arc::new(ProcessCommandRunner),
    )?);
    let shutdown = state.shutdown.clone();

    // Background sweep of expired codes, tokens and sessions
    let scheduler = scheduler_service::spawn_all(store, shutdown.clone());

    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Browser clients on another origin must be listed in `CORS_ORIGINS`
/// to send credentials; everything else gets a permissive policy.
fn cors_layer() -> CorsLayer {
    match std::env::var("CORS_ORIGINS") {
        Ok(raw) if !raw.trim().is_empty() => {
            let origins: Vec<HeaderValue> = raw
                .split(',')
                .map(str::trim)
                .filter_map(|origin| match origin.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    header::ACCEPT,
                    header::COOKIE,
                    HeaderName::from_static("x-csrf-token"),
                    HeaderName::from_static("x-terrareg-apikey"),
                ])
                .allow_credentials(true)
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    }
}

/// Resolves on Ctrl-C, SIGTERM, or when `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
