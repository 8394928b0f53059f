//! Login sessions.
//!
//! Session ids are opaque random strings with a hard expiry. Reading a
//! session never extends it.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;

use crate::config::Config;
use crate::db::repository::SessionRepository;
use crate::db::{Store, TxContext};
use crate::error::{AppError, Result};
use crate::models::session::{Session, SessionPrincipal};
use crate::services::auth_context::constant_time_eq;

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "terrareg_session";

const SESSION_ID_BYTES: usize = 32;
const CSRF_TOKEN_BYTES: usize = 24;

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_session_id() -> String {
    random_urlsafe(SESSION_ID_BYTES)
}

pub struct SessionService {
    store: Arc<dyn Store>,
    lifetime: Duration,
    admin_token: String,
}

impl SessionService {
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lifetime: Duration::minutes(config.admin_session_expiry_mins),
            admin_token: config.admin_authentication_token.clone(),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Start a session for `principal`.
    pub async fn create_session(&self, ctx: &TxContext, principal: &SessionPrincipal) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: generate_session_id(),
            expires_at: now + self.lifetime,
            provider_source_auth: principal.to_blob()?,
            csrf_token: random_urlsafe(CSRF_TOKEN_BYTES),
            created_at: now,
        };
        self.store.save_session(ctx, &session).await?;
        Ok(session)
    }

    /// The session with `id`, unless it is missing or expired.
    pub async fn find_valid_session(&self, ctx: &TxContext, id: &str) -> Result<Option<Session>> {
        if id.is_empty() {
            return Ok(None);
        }
        let session = self.store.find_session(ctx, id).await?;
        Ok(session.filter(|s| !s.is_expired(Utc::now())))
    }

    pub async fn delete_session(&self, ctx: &TxContext, id: &str) -> Result<bool> {
        self.store.delete_session(ctx, id).await
    }

    /// Password login for the built-in administrator.
    pub async fn login_admin(&self, ctx: &TxContext, password: &str) -> Result<Session> {
        if self.admin_token.is_empty() {
            return Err(AppError::Authentication("Admin login is not enabled".into()));
        }
        if !constant_time_eq(self.admin_token.as_bytes(), password.as_bytes()) {
            tracing::warn!("Rejected admin login attempt");
            return Err(AppError::Authentication("Invalid admin password".into()));
        }
        let session = self.create_session(ctx, &SessionPrincipal::Admin).await?;
        tracing::info!("Admin session started");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn service(expiry_mins: i64) -> SessionService {
        let config = Config {
            admin_authentication_token: "s3cret".into(),
            admin_session_expiry_mins: expiry_mins,
            ..Config::default()
        };
        SessionService::new(&config, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_session_id_entropy() {
        let id = generate_session_id();
        assert_eq!(id.len(), 43);
        assert_ne!(id, generate_session_id());
    }

    #[tokio::test]
    async fn test_admin_login() {
        let svc = service(60);
        let ctx = TxContext::background();
        assert!(matches!(
            svc.login_admin(&ctx, "wrong").await,
            Err(AppError::Authentication(_))
        ));
        let session = svc.login_admin(&ctx, "s3cret").await.unwrap();
        let found = svc.find_valid_session(&ctx, &session.id).await.unwrap().unwrap();
        assert_eq!(found.principal().unwrap(), SessionPrincipal::Admin);
        assert_eq!(found.expires_at, session.expires_at);

        assert!(svc.delete_session(&ctx, &session.id).await.unwrap());
        assert!(svc.find_valid_session(&ctx, &session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_ignored() {
        let svc = service(-1);
        let ctx = TxContext::background();
        let session = svc
            .create_session(
                &ctx,
                &SessionPrincipal::User {
                    username: "alice".into(),
                    groups: vec![],
                },
            )
            .await
            .unwrap();
        assert!(svc.find_valid_session(&ctx, &session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_disabled_without_admin_token() {
        let svc = SessionService::new(&Config::default(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            svc.login_admin(&TxContext::background(), "").await,
            Err(AppError::Authentication(_))
        ));
    }
}
