//! Persisted API key management.
//!
//! Token values are 256 random bits, base64url-encoded without padding. Only
//! their SHA-256 digest is stored; the plaintext is returned once at creation.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::repository::{AuthTokenFilter, AuthTokenRepository, NamespaceRepository};
use crate::db::{Store, TxContext};
use crate::error::{AppError, Result};
use crate::models::auth_token::{
    AuthTokenCreated, AuthTokenType, AuthenticationToken, MAX_DESCRIPTION_LEN,
};
use crate::services::auth_context::AuthContext;

const TOKEN_BYTES: usize = 32;

/// Generate a new random token value.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256 digest under which a token is stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTokenRequest {
    pub token_type: AuthTokenType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct TokenService {
    store: Arc<dyn Store>,
}

impl TokenService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a token. Only administrators may create tokens.
    pub async fn create_token(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        request: CreateTokenRequest,
    ) -> Result<AuthTokenCreated> {
        auth.require_admin()?;
        let now = Utc::now();

        if request.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(AppError::Validation(format!(
                "Description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(AppError::Validation("Expiry must be in the future".into()));
            }
        }

        let namespace = match (request.token_type, request.namespace) {
            (AuthTokenType::Publish, Some(namespace)) => {
                let found = self
                    .store
                    .find_namespace(ctx, &namespace)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Namespace {} does not exist", namespace))
                    })?;
                Some(found.name)
            }
            (AuthTokenType::Publish, None) => {
                return Err(AppError::Validation(
                    "Publish tokens must be bound to a namespace".into(),
                ))
            }
            (_, Some(_)) => {
                return Err(AppError::Validation(format!(
                    "{} tokens cannot be bound to a namespace",
                    request.token_type
                )))
            }
            (_, None) => None,
        };

        let value = generate_token();
        let token = AuthenticationToken {
            id: Uuid::new_v4(),
            token_type: request.token_type,
            token_hash: hash_token(&value),
            description: request.description,
            namespace,
            expires_at: request.expires_at,
            active: true,
            created_by: auth.username().map(String::from),
            created_at: now,
        };
        self.store.save_token(ctx, &token).await?;

        tracing::info!(
            token_id = %token.id,
            token_type = %token.token_type,
            namespace = ?token.namespace,
            "Created authentication token"
        );

        Ok(AuthTokenCreated {
            id: token.id,
            token: value,
            token_type: token.token_type,
            description: token.description,
            namespace: token.namespace,
            expires_at: token.expires_at,
        })
    }

    /// Look up a presented token and check it is active and unexpired.
    pub async fn validate_token(&self, ctx: &TxContext, value: &str) -> Result<AuthenticationToken> {
        let token = self
            .store
            .find_token_by_hash(ctx, &hash_token(value))
            .await?
            .ok_or_else(|| AppError::Authentication("Invalid API key".into()))?;
        token.validate(Utc::now())?;
        Ok(token)
    }

    /// Deactivate a token. Tokens are never deleted.
    pub async fn revoke_token(&self, auth: &AuthContext, ctx: &TxContext, id: Uuid) -> Result<()> {
        auth.require_admin()?;
        let mut token = self
            .store
            .find_token(ctx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Token {} not found", id)))?;
        token.revoke()?;
        self.store.save_token(ctx, &token).await?;
        tracing::info!(token_id = %id, "Revoked authentication token");
        Ok(())
    }

    pub async fn list_tokens(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        filter: &AuthTokenFilter,
    ) -> Result<Vec<AuthenticationToken>> {
        auth.require_admin()?;
        self.store.list_tokens(ctx, filter).await
    }
}

/// Context granted by a validated persisted token.
pub fn context_for_token(token: &AuthenticationToken) -> AuthContext {
    match token.token_type {
        AuthTokenType::Admin => AuthContext::AdminApiKey { built_in: false },
        AuthTokenType::Upload => AuthContext::UploadApiKey,
        AuthTokenType::Publish => AuthContext::PublishApiKey {
            namespace: token.namespace.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::namespace::{Namespace, NamespaceType};
    use chrono::Duration;

    async fn service() -> (TokenService, TxContext) {
        let store = Arc::new(MemoryStore::new());
        let ctx = TxContext::background();
        store
            .save_namespace(
                &ctx,
                &Namespace::new("acme", None, NamespaceType::Organisation).unwrap(),
            )
            .await
            .unwrap();
        (TokenService::new(store), ctx)
    }

    fn admin() -> AuthContext {
        AuthContext::AdminApiKey { built_in: true }
    }

    fn publish_request(namespace: Option<&str>) -> CreateTokenRequest {
        CreateTokenRequest {
            token_type: AuthTokenType::Publish,
            description: "CI publisher".into(),
            namespace: namespace.map(String::from),
            expires_at: None,
        }
    }

    #[test]
    fn test_generated_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(!token.contains('='));
        assert_ne!(token, generate_token());
        assert_eq!(hash_token("abc").len(), 64);
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let (svc, ctx) = service().await;
        let created = svc
            .create_token(&admin(), &ctx, publish_request(Some("ACME")))
            .await
            .unwrap();
        assert_eq!(created.namespace.as_deref(), Some("acme"));

        let token = svc.validate_token(&ctx, &created.token).await.unwrap();
        assert!(token.can_access_namespace("acme"));
        assert!(!token.can_access_namespace("other"));
        assert_eq!(
            context_for_token(&token),
            AuthContext::PublishApiKey {
                namespace: "acme".into()
            }
        );
    }

    #[tokio::test]
    async fn test_revoke_then_validate() {
        let (svc, ctx) = service().await;
        let created = svc
            .create_token(&admin(), &ctx, publish_request(Some("acme")))
            .await
            .unwrap();
        svc.revoke_token(&admin(), &ctx, created.id).await.unwrap();

        assert!(matches!(
            svc.validate_token(&ctx, &created.token).await,
            Err(AppError::TokenInactive)
        ));
        assert!(matches!(
            svc.revoke_token(&admin(), &ctx, created.id).await,
            Err(AppError::AlreadyRevoked)
        ));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (svc, ctx) = service().await;
        assert!(matches!(
            svc.create_token(&admin(), &ctx, publish_request(None)).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            svc.create_token(&admin(), &ctx, publish_request(Some("missing"))).await,
            Err(AppError::NotFound(_))
        ));

        let mut upload = publish_request(Some("acme"));
        upload.token_type = AuthTokenType::Upload;
        assert!(matches!(
            svc.create_token(&admin(), &ctx, upload).await,
            Err(AppError::Validation(_))
        ));

        let mut past = publish_request(Some("acme"));
        past.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(matches!(
            svc.create_token(&admin(), &ctx, past).await,
            Err(AppError::Validation(_))
        ));

        let mut long = publish_request(Some("acme"));
        long.description = "x".repeat(256);
        assert!(matches!(
            svc.create_token(&admin(), &ctx, long).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_create() {
        let (svc, ctx) = service().await;
        let result = svc
            .create_token(&AuthContext::UploadApiKey, &ctx, publish_request(Some("acme")))
            .await;
        assert!(matches!(result, Err(AppError::Authorization(_))));
        let result = svc
            .create_token(&AuthContext::NotAuthenticated, &ctx, publish_request(Some("acme")))
            .await;
        assert!(matches!(result, Err(AppError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_unknown_token_is_authentication_error() {
        let (svc, ctx) = service().await;
        assert!(matches!(
            svc.validate_token(&ctx, "not-a-token").await,
            Err(AppError::Authentication(_))
        ));
    }
}
