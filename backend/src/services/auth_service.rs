//! Authentication service.
//!
//! Reduces the credentials presented with a request to a single
//! [`AuthContext`] by trying each [`AuthMethod`] in priority order. The first
//! method that recognises the credentials wins; a method that fails is
//! skipped, and a request nothing recognises is `NotAuthenticated`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use crate::config::{AnalyticsAuthKey, Config};
use crate::db::repository::UserGroupRepository;
use crate::db::{Store, TxContext};
use crate::error::Result;
use crate::models::permission::NamespacePermissions;
use crate::models::session::{Session, SessionPrincipal};
use crate::models::user_group::effective_permissions;
use crate::services::auth_context::{constant_time_eq, AuthContext, UserPrincipal};
use crate::services::session_service::{SessionService, SESSION_COOKIE};
use crate::services::terraform_idp_service::TerraformIdpService;
use crate::services::token_service::{context_for_token, TokenService};

/// Header carrying the admin token or a persisted API key.
pub const API_KEY_HEADER: &str = "x-terrareg-apikey";

/// Claim or attribute listing an SSO user's groups.
const SSO_GROUPS_KEY: &str = "groups";

/// Raw credentials extracted from a request.
#[derive(Clone, Default)]
pub struct RequestCredentials {
    pub api_key: Option<String>,
    pub bearer: Option<String>,
    pub session_id: Option<String>,
}

redacted_debug!(RequestCredentials {
    redact_option api_key,
    redact_option bearer,
    redact_option session_id,
});

impl RequestCredentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let non_empty = |value: &str| {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        };

        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(non_empty);

        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| {
                h.strip_prefix("Bearer ")
                    .or_else(|| h.strip_prefix("bearer "))
            })
            .and_then(non_empty);

        let session_id = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|h| h.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .and_then(|(_, value)| non_empty(value));

        Self {
            api_key,
            bearer,
            session_id,
        }
    }
}

/// One way of recognising a request's credentials.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the credentials are not for this method.
    async fn resolve(&self, ctx: &TxContext, creds: &RequestCredentials) -> Result<Option<AuthContext>>;
}

/// The configured admin token in the API key header.
pub struct AdminApiKeyMethod {
    admin_token: String,
}

#[async_trait]
impl AuthMethod for AdminApiKeyMethod {
    fn name(&self) -> &'static str {
        "admin_api_key"
    }

    async fn resolve(&self, _ctx: &TxContext, creds: &RequestCredentials) -> Result<Option<AuthContext>> {
        let Some(key) = &creds.api_key else {
            return Ok(None);
        };
        if self.admin_token.is_empty() || !constant_time_eq(key.as_bytes(), self.admin_token.as_bytes()) {
            return Ok(None);
        }
        Ok(Some(AuthContext::AdminApiKey { built_in: true }))
    }
}

/// A persisted authentication token in the API key header.
pub struct PersistedTokenMethod {
    tokens: Arc<TokenService>,
}

#[async_trait]
impl AuthMethod for PersistedTokenMethod {
    fn name(&self) -> &'static str {
        "api_token"
    }

    async fn resolve(&self, ctx: &TxContext, creds: &RequestCredentials) -> Result<Option<AuthContext>> {
        let Some(key) = &creds.api_key else {
            return Ok(None);
        };
        let token = self.tokens.validate_token(ctx, key).await?;
        Ok(Some(context_for_token(&token)))
    }
}

/// An access token issued by the Terraform identity provider.
pub struct TerraformOidcMethod {
    idp: Arc<TerraformIdpService>,
}

#[async_trait]
impl AuthMethod for TerraformOidcMethod {
    fn name(&self) -> &'static str {
        "terraform_oidc"
    }

    async fn resolve(&self, ctx: &TxContext, creds: &RequestCredentials) -> Result<Option<AuthContext>> {
        match &creds.bearer {
            Some(token) if self.idp.is_enabled() && token.matches('.').count() == 2 => {
                self.idp.validate_bearer(ctx, token).await.map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Static analytics and internal extraction tokens sent by Terraform as bearers.
pub struct TerraformStaticTokenMethod {
    analytics_keys: Vec<AnalyticsAuthKey>,
    internal_extraction_token: String,
}

#[async_trait]
impl AuthMethod for TerraformStaticTokenMethod {
    fn name(&self) -> &'static str {
        "terraform_static_token"
    }

    async fn resolve(&self, _ctx: &TxContext, creds: &RequestCredentials) -> Result<Option<AuthContext>> {
        let Some(token) = &creds.bearer else {
            return Ok(None);
        };
        if !self.internal_extraction_token.is_empty()
            && constant_time_eq(token.as_bytes(), self.internal_extraction_token.as_bytes())
        {
            return Ok(Some(AuthContext::TerraformInternalExtraction));
        }
        Ok(self
            .analytics_keys
            .iter()
            .find(|k| constant_time_eq(token.as_bytes(), k.key.as_bytes()))
            .map(|k| AuthContext::TerraformAnalytics {
                key: k.key.clone(),
                allowed_modules: k.allowed_modules.clone(),
            }))
    }
}

/// The session cookie of a logged-in browser.
pub struct SessionMethod {
    sessions: Arc<SessionService>,
    store: Arc<dyn Store>,
}

#[async_trait]
impl AuthMethod for SessionMethod {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn resolve(&self, ctx: &TxContext, creds: &RequestCredentials) -> Result<Option<AuthContext>> {
        let Some(id) = &creds.session_id else {
            return Ok(None);
        };
        match self.sessions.find_valid_session(ctx, id).await? {
            Some(session) => session_context(self.store.as_ref(), ctx, &session).await.map(Some),
            None => Ok(None),
        }
    }
}

fn sso_groups_from_claims(claims: &serde_json::Value) -> Vec<String> {
    claims
        .get(SSO_GROUPS_KEY)
        .and_then(|g| g.as_array())
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

async fn user_principal(
    store: &dyn Store,
    ctx: &TxContext,
    username: String,
    groups: Vec<String>,
) -> Result<UserPrincipal> {
    let found = store.find_user_groups_by_names(ctx, &groups).await?;
    Ok(UserPrincipal {
        username,
        site_admin: found.iter().any(|g| g.site_admin),
        permissions: effective_permissions(&found, &NamespacePermissions::new()),
        groups,
    })
}

/// Build the context of a session from its stored principal.
pub async fn session_context(store: &dyn Store, ctx: &TxContext, session: &Session) -> Result<AuthContext> {
    let csrf_token = session.csrf_token.clone();
    Ok(match session.principal()? {
        SessionPrincipal::Admin => AuthContext::AdminSession { csrf_token },
        SessionPrincipal::User { username, groups } => AuthContext::UserSession {
            user: user_principal(store, ctx, username, groups).await?,
            csrf_token,
        },
        SessionPrincipal::Github {
            username,
            organisations,
        } => AuthContext::Github {
            username,
            organisations,
            csrf_token,
        },
        SessionPrincipal::Saml {
            username,
            attributes,
        } => {
            let groups = attributes.get(SSO_GROUPS_KEY).cloned().unwrap_or_default();
            AuthContext::Saml {
                user: user_principal(store, ctx, username, groups).await?,
                attributes,
                csrf_token,
            }
        }
        SessionPrincipal::Oidc { username, claims } => {
            let groups = sso_groups_from_claims(&claims);
            AuthContext::Oidc {
                user: user_principal(store, ctx, username, groups).await?,
                claims,
                csrf_token,
            }
        }
    })
}

/// Authentication service
pub struct AuthService {
    methods: Vec<Box<dyn AuthMethod>>,
}

impl AuthService {
    /// Build the resolver chain in priority order.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        tokens: Arc<TokenService>,
        sessions: Arc<SessionService>,
        idp: Arc<TerraformIdpService>,
    ) -> Self {
        Self::with_methods(vec![
            Box::new(AdminApiKeyMethod {
                admin_token: config.admin_authentication_token.clone(),
            }),
            Box::new(PersistedTokenMethod { tokens }),
            Box::new(TerraformOidcMethod { idp }),
            Box::new(TerraformStaticTokenMethod {
                analytics_keys: config.analytics_auth_keys.clone(),
                internal_extraction_token: config.internal_extraction_analytics_token.clone(),
            }),
            Box::new(SessionMethod { sessions, store }),
        ])
    }

    pub fn with_methods(methods: Vec<Box<dyn AuthMethod>>) -> Self {
        Self { methods }
    }

    /// Resolve credentials to a context. Never fails.
    pub async fn resolve(&self, ctx: &TxContext, creds: &RequestCredentials) -> AuthContext {
        for method in &self.methods {
            match method.resolve(ctx, creds).await {
                Ok(Some(auth)) => {
                    tracing::debug!(method = method.name(), auth_method = auth.auth_method(), "Request authenticated");
                    return auth;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(method = method.name(), error = %e, "Credentials rejected");
                }
            }
        }
        AuthContext::NotAuthenticated
    }
}
