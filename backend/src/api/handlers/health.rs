//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::SharedState;
use crate::db::transaction::{TransactionBackend, TransactionHandle};
use crate::db::Store;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub database: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckStatus {
    fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            message: None,
        }
    }

    fn unhealthy(message: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message),
        }
    }
}

/// Open and roll back a transaction to prove the store is reachable.
async fn check_store(store: &dyn Store) -> CheckStatus {
    match store.begin().await {
        Ok(handle) => match handle.rollback().await {
            Ok(()) => CheckStatus::healthy(),
            Err(e) => CheckStatus::unhealthy(format!("Database rollback failed: {}", e)),
        },
        Err(e) => CheckStatus::unhealthy(format!("Database connection failed: {}", e)),
    }
}

/// Health check endpoint - basic liveness check
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let database = check_store(state.store.as_ref()).await;
    let healthy = database.status == "healthy";
    if !healthy {
        tracing::warn!(message = ?database.message, "Health check failed");
    }

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { database },
    };
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_memory_store_is_healthy() {
        let store = MemoryStore::new();
        let check = check_store(&store).await;
        assert_eq!(check.status, "healthy");
        assert!(check.message.is_none());
    }

    #[test]
    fn test_unhealthy_serializes_message() {
        let value = serde_json::to_value(CheckStatus::unhealthy("down".into())).unwrap();
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["message"], "down");
    }
}
