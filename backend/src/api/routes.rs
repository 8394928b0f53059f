//! Route definitions for the API.

use axum::{middleware, routing::get, Router};

use super::handlers;
use super::middleware::auth::auth_middleware;
use super::middleware::tracing::correlation_id_middleware;
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        // Health endpoint (no auth required)
        .route("/health", get(handlers::health::health_check))
        // Terraform service discovery and registry protocol
        .route(
            "/.well-known/terraform.json",
            get(handlers::terraform::service_discovery),
        )
        .nest("/v1/modules", handlers::terraform::router())
        // Terrareg API
        .nest("/v1/terrareg", terrareg_routes())
        // Terraform CLI identity provider
        .merge(handlers::oidc::router())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(correlation_id_middleware))
        .with_state(state)
}

/// Terrareg v1 routes
fn terrareg_routes() -> Router<SharedState> {
    Router::new()
        .nest("/modules", handlers::modules::router())
        .nest("/namespaces", handlers::namespaces::router())
        .nest("/gpg-keys", handlers::namespaces::gpg_router())
        .nest("/user-groups", handlers::groups::router())
        .nest("/auth", handlers::auth::router())
}
