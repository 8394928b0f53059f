//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Missing or invalid credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authenticated, but not allowed
    #[error("Access denied: {0}")]
    Authorization(String),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Entity with the same identity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Domain rule broken (e.g. publishing a version twice)
    #[error("Domain violation: {0}")]
    DomainViolation(String),

    /// Concurrent operation on the same resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token inactive")]
    TokenInactive,

    #[error("Token already revoked")]
    AlreadyRevoked,

    #[error("Authorization code already exchanged")]
    AuthCodeAlreadyExchanged,

    #[error("Authorization code expired")]
    AuthCodeExpired,

    /// Git clone or checkout failed
    #[error("Git clone failed: {0}")]
    GitCloneFailed(String),

    /// Neither version nor tag could be resolved to a version
    #[error("Version unresolvable: {0}")]
    VersionUnresolvable(String),

    /// Module source could not be parsed
    #[error("Parse failed: {0}")]
    ParseFailed(String),

    /// Archive generation failed
    #[error("Archive failed: {0}")]
    ArchiveFailed(String),

    /// Persisting the module aggregate failed
    #[error("Persist failed: {0}")]
    PersistFailed(String),

    #[error("Terraform OIDC identity provider is not configured")]
    IdpNotConfigured,

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address parse error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JWT error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Error kind as exposed to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) | AppError::VersionUnresolvable(_) | AppError::Json(_) => {
                "invalid-input"
            }
            AppError::NotFound(_) => "not-found",
            AppError::AlreadyExists(_) => "already-exists",
            AppError::DomainViolation(_) => "domain-violation",
            AppError::Authentication(_) | AppError::Jwt(_) => "unauthorized",
            AppError::Authorization(_) => "forbidden",
            AppError::TokenExpired => "token-expired",
            AppError::TokenInactive => "token-inactive",
            AppError::AlreadyRevoked => "already-revoked",
            AppError::AuthCodeAlreadyExchanged => "auth-code-already-exchanged",
            AppError::AuthCodeExpired => "auth-code-expired",
            AppError::GitCloneFailed(_) => "git-clone-failed",
            AppError::ParseFailed(_) => "parse-failed",
            AppError::ArchiveFailed(_) => "archive-failed",
            AppError::PersistFailed(_) => "persist-failed",
            AppError::IdpNotConfigured => "idp-not-configured",
            AppError::Conflict(_) => "conflict",
            AppError::Cancelled => "cancelled",
            AppError::Config(_)
            | AppError::Database(_)
            | AppError::Migration(_)
            | AppError::Storage(_)
            | AppError::Io(_)
            | AppError::AddrParse(_)
            | AppError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Migration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MIGRATION_ERROR"),
            AppError::Authentication(_) => (StatusCode::UNAUTHORIZED, "AUTH_ERROR"),
            AppError::Authorization(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::AlreadyExists(_) => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
            AppError::DomainViolation(_) => (StatusCode::CONFLICT, "DOMAIN_VIOLATION"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::TokenExpired => (StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED"),
            AppError::TokenInactive => (StatusCode::UNAUTHORIZED, "TOKEN_INACTIVE"),
            AppError::AlreadyRevoked => (StatusCode::CONFLICT, "ALREADY_REVOKED"),
            AppError::AuthCodeAlreadyExchanged => {
                (StatusCode::BAD_REQUEST, "AUTH_CODE_ALREADY_EXCHANGED")
            }
            AppError::AuthCodeExpired => (StatusCode::BAD_REQUEST, "AUTH_CODE_EXPIRED"),
            AppError::GitCloneFailed(_) => (StatusCode::BAD_GATEWAY, "GIT_CLONE_FAILED"),
            AppError::VersionUnresolvable(_) => {
                (StatusCode::BAD_REQUEST, "VERSION_UNRESOLVABLE")
            }
            AppError::ParseFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "PARSE_FAILED"),
            AppError::ArchiveFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ARCHIVE_FAILED"),
            AppError::PersistFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PERSIST_FAILED"),
            AppError::IdpNotConfigured => (StatusCode::NOT_FOUND, "IDP_NOT_CONFIGURED"),
            AppError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
            AppError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            AppError::AddrParse(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ADDR_PARSE_ERROR"),
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "JSON_ERROR"),
            AppError::Jwt(_) => (StatusCode::UNAUTHORIZED, "JWT_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        self.status_code().0
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_code();
        let message = match &self {
            AppError::Database(_) => "Database operation failed".to_string(),
            AppError::Migration(_) => "Database migration failed".to_string(),
            AppError::Io(_) => "IO operation failed".to_string(),
            AppError::AddrParse(_) => "Invalid address".to_string(),
            AppError::Json(_) => "Invalid JSON".to_string(),
            AppError::Jwt(_) => "Invalid token".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, code = code, "Request error");
        } else {
            tracing::debug!(error = %self, code = code, "Request rejected");
        }

        let body = Json(json!({
            "code": code,
            "kind": self.kind(),
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_conflict() {
        assert_eq!(
            AppError::DomainViolation("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(AppError::AlreadyExists("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(AppError::Conflict("x".into()).status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(AppError::Validation("x".into()).kind(), "invalid-input");
        assert_eq!(AppError::Authentication("x".into()).kind(), "unauthorized");
        assert_eq!(AppError::Authorization("x".into()).kind(), "forbidden");
        assert_eq!(
            AppError::AuthCodeAlreadyExchanged.kind(),
            "auth-code-already-exchanged"
        );
        assert_eq!(AppError::Internal("boom".into()).kind(), "internal");
    }

    #[test]
    fn test_into_response_status() {
        let response = AppError::NotFound("module".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = AppError::TokenInactive.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
