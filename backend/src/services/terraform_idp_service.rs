//! OpenID Connect identity provider used by `terraform login`.
//!
//! Authorization codes are single use and live for ten minutes. Access
//! tokens are RS256 JWTs carrying a `kid` header; keys retired by a
//! rotation stay in the JWKS for one token lifetime so tokens they signed
//! remain verifiable until they expire.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{Config, TerraformOidcConfig};
use crate::db::repository::TerraformIdpRepository;
use crate::db::{with_transaction, Store, TxContext};
use crate::error::{AppError, Result};
use crate::models::terraform_idp::{
    AccessToken, AuthorizationCode, CodeChallengeMethod, SubjectIdentifier,
    AUTHORIZATION_CODE_TTL_SECS,
};
use crate::services::auth_context::{constant_time_eq, AuthContext, TERRAFORM_READ_SCOPE};
use crate::services::token_service::generate_token;

pub const AUTHORIZE_PATH: &str = "/terraform/oidc/authorize";
pub const TOKEN_PATH: &str = "/terraform/oidc/token";
pub const USERINFO_PATH: &str = "/terraform/oidc/userinfo";
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Loopback ports `terraform login` listens on for the redirect.
pub const LOGIN_PORTS: (u16, u16) = (10000, 10010);

const RSA_KEY_BITS: usize = 2048;
const KEY_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Jwk {
    pub kty: &'static str,
    pub kid: String,
    #[serde(rename = "use")]
    pub key_use: &'static str,
    pub alg: &'static str,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// RSA key the provider signs access tokens with.
pub struct SigningKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Jwk,
}

impl SigningKey {
    pub fn generate() -> Result<Self> {
        let mut rng = rsa::rand_core::OsRng;
        let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| AppError::Internal(format!("Failed to generate RSA key: {}", e)))?;
        Self::from_private_key(&key)
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Config(format!("Invalid OIDC signing key: {}", e)))?;
        Self::from_private_key(&key)
    }

    fn from_private_key(key: &RsaPrivateKey) -> Result<Self> {
        let der = key
            .to_pkcs1_der()
            .map_err(|e| AppError::Internal(format!("Failed to encode RSA key: {}", e)))?;
        let n_bytes = key.n().to_bytes_be();
        let e_bytes = key.e().to_bytes_be();

        let mut hasher = Sha256::new();
        hasher.update(&n_bytes);
        hasher.update(&e_bytes);
        let kid = hex::encode(hasher.finalize())[..KEY_ID_LEN].to_string();

        let n = URL_SAFE_NO_PAD.encode(&n_bytes);
        let e = URL_SAFE_NO_PAD.encode(&e_bytes);
        Ok(Self {
            encoding: EncodingKey::from_rsa_der(der.as_bytes()),
            decoding: DecodingKey::from_rsa_components(&n, &e)?,
            jwk: Jwk {
                kty: "RSA",
                kid,
                key_use: "sig",
                alg: "RS256",
                n,
                e,
            },
        })
    }

    pub fn kid(&self) -> &str {
        &self.jwk.kid
    }
}

struct KeyRing {
    current: Arc<SigningKey>,
    retired: Vec<(Arc<SigningKey>, DateTime<Utc>)>,
}

impl KeyRing {
    /// Keys whose signatures may still be accepted at `now`.
    fn live(&self, now: DateTime<Utc>, token_ttl: Duration) -> impl Iterator<Item = &Arc<SigningKey>> {
        std::iter::once(&self.current).chain(
            self.retired
                .iter()
                .filter(move |(_, retired_at)| *retired_at + token_ttl > now)
                .map(|(key, _)| key),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<&'static str>,
    pub scopes_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeRequest {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub state: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeOutcome {
    /// Send the browser back to the client with `code` and `state`.
    Redirect(String),
    /// No interactive session; the user must log in first.
    LoginRequired,
}

#[derive(Clone, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: String,
    #[serde(default)]
    pub code: String,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub code_verifier: Option<String>,
}

redacted_debug!(TokenRequest {
    show grant_type,
    redact code,
    show redirect_uri,
    show client_id,
    redact_option code_verifier,
});

#[derive(Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default)]
    pub scope: String,
}

impl AccessTokenClaims {
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(String::from).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub sub: String,
}

/// Check a PKCE `code_verifier` against the challenge recorded at authorize time.
pub fn verify_pkce(method: CodeChallengeMethod, challenge: &str, verifier: &str) -> bool {
    match method {
        CodeChallengeMethod::S256 => {
            let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            constant_time_eq(computed.as_bytes(), challenge.as_bytes())
        }
        CodeChallengeMethod::Plain => constant_time_eq(verifier.as_bytes(), challenge.as_bytes()),
    }
}

fn loopback_login_port(uri: &str) -> Option<u16> {
    let rest = uri
        .strip_prefix("http://localhost:")
        .or_else(|| uri.strip_prefix("http://127.0.0.1:"))?;
    let (port, path) = rest.split_once('/')?;
    if path != "login" {
        return None;
    }
    port.parse::<u16>()
        .ok()
        .filter(|p| (LOGIN_PORTS.0..=LOGIN_PORTS.1).contains(p))
}

/// Contexts backed by an interactive browser login.
fn is_interactive(auth: &AuthContext) -> bool {
    matches!(
        auth,
        AuthContext::AdminSession { .. }
            | AuthContext::UserSession { .. }
            | AuthContext::Saml { .. }
            | AuthContext::Oidc { .. }
            | AuthContext::Github { .. }
    )
}

pub struct TerraformIdpService {
    store: Arc<dyn Store>,
    settings: TerraformOidcConfig,
    issuer: String,
    keys: Option<RwLock<KeyRing>>,
}

impl TerraformIdpService {
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Result<Self> {
        let settings = config.terraform_oidc.clone();
        let keys = if settings.is_enabled() {
            let key = match &settings.signing_key_path {
                Some(path) => {
                    let pem = std::fs::read_to_string(path).map_err(|e| {
                        AppError::Config(format!("Cannot read OIDC signing key {}: {}", path, e))
                    })?;
                    SigningKey::from_pkcs8_pem(&pem)?
                }
                None => {
                    tracing::warn!("No OIDC signing key configured, generating an ephemeral key");
                    SigningKey::generate()?
                }
            };
            tracing::info!(kid = %key.kid(), "Terraform OIDC identity provider enabled");
            Some(RwLock::new(KeyRing {
                current: Arc::new(key),
                retired: Vec::new(),
            }))
        } else {
            None
        };
        Ok(Self {
            store,
            issuer: settings.issuer_url.trim_end_matches('/').to_string(),
            settings,
            keys,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.keys.is_some()
    }

    fn token_ttl(&self) -> Duration {
        Duration::seconds(self.settings.token_ttl_secs)
    }

    fn ring(&self) -> Result<RwLockReadGuard<'_, KeyRing>> {
        let keys = self.keys.as_ref().ok_or(AppError::IdpNotConfigured)?;
        Ok(keys.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the signing key. The previous key stays published for one
    /// token lifetime.
    pub fn rotate_signing_key(&self, key: SigningKey) -> Result<()> {
        let keys = self.keys.as_ref().ok_or(AppError::IdpNotConfigured)?;
        let mut ring = keys.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let ttl = self.token_ttl();
        ring.retired.retain(|(_, retired_at)| *retired_at + ttl > now);
        let previous = std::mem::replace(&mut ring.current, Arc::new(key));
        tracing::info!(
            retired_kid = %previous.kid(),
            kid = %ring.current.kid(),
            "Rotated OIDC signing key"
        );
        ring.retired.push((previous, now));
        Ok(())
    }

    pub fn discovery_document(&self) -> Result<DiscoveryDocument> {
        if !self.is_enabled() {
            return Err(AppError::IdpNotConfigured);
        }
        Ok(DiscoveryDocument {
            issuer: self.issuer.clone(),
            authorization_endpoint: format!("{}{}", self.issuer, AUTHORIZE_PATH),
            token_endpoint: format!("{}{}", self.issuer, TOKEN_PATH),
            userinfo_endpoint: format!("{}{}", self.issuer, USERINFO_PATH),
            jwks_uri: format!("{}{}", self.issuer, JWKS_PATH),
            response_types_supported: vec!["code"],
            grant_types_supported: vec!["authorization_code"],
            subject_types_supported: vec!["public"],
            id_token_signing_alg_values_supported: vec!["RS256"],
            scopes_supported: vec!["openid", "profile", TERRAFORM_READ_SCOPE],
            code_challenge_methods_supported: vec!["S256", "plain"],
            token_endpoint_auth_methods_supported: vec!["none"],
        })
    }

    pub fn jwks(&self) -> Result<JwkSet> {
        let ring = self.ring()?;
        Ok(JwkSet {
            keys: ring
                .live(Utc::now(), self.token_ttl())
                .map(|key| key.jwk.clone())
                .collect(),
        })
    }

    /// The `login.v1` entry of Terraform service discovery.
    pub fn login_service(&self) -> Option<serde_json::Value> {
        self.is_enabled().then(|| {
            serde_json::json!({
                "client": self.settings.client_id,
                "grant_types": ["authz_code"],
                "authz": AUTHORIZE_PATH,
                "token": TOKEN_PATH,
                "ports": [LOGIN_PORTS.0, LOGIN_PORTS.1],
            })
        })
    }

    fn redirect_uri_allowed(&self, uri: &str) -> bool {
        if self.settings.allow_unsafe_redirects {
            return true;
        }
        if self.settings.redirect_uris.iter().any(|allowed| allowed == uri) {
            return true;
        }
        loopback_login_port(uri).is_some()
            && self
                .settings
                .redirect_uris
                .iter()
                .any(|allowed| loopback_login_port(allowed).is_some())
    }

    /// Issue an authorization code for the logged-in principal.
    pub async fn authorize(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        request: AuthorizeRequest,
    ) -> Result<AuthorizeOutcome> {
        if !self.is_enabled() {
            return Err(AppError::IdpNotConfigured);
        }
        if request.client_id != self.settings.client_id {
            return Err(AppError::Validation("Unknown client_id".into()));
        }
        if request.redirect_uri.is_empty() || !self.redirect_uri_allowed(&request.redirect_uri) {
            return Err(AppError::Validation("redirect_uri is not allowed".into()));
        }
        if request.response_type != "code" {
            return Err(AppError::Validation("response_type must be code".into()));
        }
        if !request.scope.split_whitespace().any(|s| s == "openid") {
            return Err(AppError::Validation("scope must include openid".into()));
        }
        if request.state.is_empty() {
            return Err(AppError::Validation("state is required".into()));
        }
        let code_challenge_method = match (&request.code_challenge, &request.code_challenge_method) {
            (None, _) => None,
            (Some(_), None) => Some(CodeChallengeMethod::Plain),
            (Some(_), Some(raw)) => Some(CodeChallengeMethod::parse(raw).ok_or_else(|| {
                AppError::Validation(format!("Unsupported code_challenge_method {}", raw))
            })?),
        };

        if !is_interactive(auth) {
            return Ok(AuthorizeOutcome::LoginRequired);
        }
        let Some(username) = auth.username() else {
            return Ok(AuthorizeOutcome::LoginRequired);
        };

        let now = Utc::now();
        let subject = self.bind_subject(ctx, username, auth.auth_method(), now).await?;
        let code = AuthorizationCode {
            code: generate_token(),
            client_id: request.client_id,
            redirect_uri: request.redirect_uri,
            scope: request.scope,
            state: request.state,
            nonce: request.nonce,
            code_challenge: request.code_challenge,
            code_challenge_method,
            subject_identifier: Some(subject.id),
            expires_at: now + Duration::seconds(AUTHORIZATION_CODE_TTL_SECS),
            exchanged_at: None,
            created_at: now,
        };
        self.store.save_authorization_code(ctx, &code).await?;
        tracing::info!(subject = %subject.subject, auth_method = %subject.auth_method, "Issued authorization code");

        let separator = if code.redirect_uri.contains('?') { '&' } else { '?' };
        Ok(AuthorizeOutcome::Redirect(format!(
            "{}{}code={}&state={}",
            code.redirect_uri,
            separator,
            urlencoding::encode(&code.code),
            urlencoding::encode(&code.state)
        )))
    }

    async fn bind_subject(
        &self,
        ctx: &TxContext,
        username: &str,
        auth_method: &str,
        now: DateTime<Utc>,
    ) -> Result<SubjectIdentifier> {
        let existing = self
            .store
            .find_subject_identifier(ctx, username, &self.issuer, auth_method)
            .await?;
        let subject = match existing {
            Some(mut subject) => {
                subject.last_seen_at = now;
                subject
            }
            None => SubjectIdentifier {
                id: Uuid::new_v4(),
                subject: username.to_string(),
                issuer: self.issuer.clone(),
                auth_method: auth_method.to_string(),
                metadata: serde_json::json!({ "username": username }),
                created_at: now,
                last_seen_at: now,
            },
        };
        self.store.save_subject_identifier(ctx, &subject).await?;
        Ok(subject)
    }

    /// Exchange an authorization code for a signed access token.
    pub async fn exchange_code(&self, ctx: &TxContext, request: TokenRequest) -> Result<TokenResponse> {
        if !self.is_enabled() {
            return Err(AppError::IdpNotConfigured);
        }
        if request.grant_type != "authorization_code" {
            return Err(AppError::Validation("grant_type must be authorization_code".into()));
        }
        if request.code.is_empty() {
            return Err(AppError::Validation("code is required".into()));
        }

        let store = self.store.as_ref();
        let request = &request;
        let result = with_transaction(store, ctx, "exchange_authorization_code", |tx| async move {
            let now = Utc::now();
            let code = store
                .find_authorization_code(&tx, &request.code)
                .await?
                .ok_or_else(|| AppError::Validation("Unknown authorization code".into()))?;
            if code.is_exchanged() {
                return Err(AppError::AuthCodeAlreadyExchanged);
            }
            if code.is_expired(now) {
                return Err(AppError::AuthCodeExpired);
            }
            if let Some(client_id) = &request.client_id {
                if *client_id != code.client_id {
                    return Err(AppError::Validation("client_id does not match".into()));
                }
            }
            if let Some(redirect_uri) = &request.redirect_uri {
                if *redirect_uri != code.redirect_uri {
                    return Err(AppError::Validation("redirect_uri does not match".into()));
                }
            }
            if let Some(challenge) = &code.code_challenge {
                let method = code.code_challenge_method.unwrap_or(CodeChallengeMethod::Plain);
                let verifier = request
                    .code_verifier
                    .as_deref()
                    .ok_or_else(|| AppError::Validation("code_verifier is required".into()))?;
                if !verify_pkce(method, challenge, verifier) {
                    return Err(AppError::Validation("code_verifier does not match".into()));
                }
            }

            if !store.mark_authorization_code_exchanged(&tx, &code.code, now).await? {
                return Err(AppError::AuthCodeAlreadyExchanged);
            }

            let subject = match code.subject_identifier {
                Some(id) => store.find_subject_identifier_by_id(&tx, id).await?,
                None => None,
            }
            .ok_or_else(|| AppError::Internal("Authorization code has no subject".into()))?;

            let (access_token, claims) = self.sign_access_token(&subject.subject, &code.client_id, &code.scope, now)?;
            store
                .save_access_token(
                    &tx,
                    &AccessToken {
                        jti: claims.jti.clone(),
                        authorization_code: code.code.clone(),
                        subject_identifier: Some(subject.id),
                        scope: code.scope.clone(),
                        expires_at: now + self.token_ttl(),
                        created_at: now,
                    },
                )
                .await?;
            tracing::info!(subject = %claims.sub, jti = %claims.jti, "Issued Terraform access token");

            Ok(TokenResponse {
                access_token,
                token_type: "Bearer",
                expires_in: self.settings.token_ttl_secs,
                scope: code.scope,
            })
        })
        .await;

        if let Err(AppError::AuthCodeAlreadyExchanged) = &result {
            tracing::warn!("Rejected replayed authorization code");
        }
        result
    }

    fn sign_access_token(
        &self,
        subject: &str,
        client_id: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, AccessTokenClaims)> {
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: client_id.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.token_ttl()).timestamp(),
            jti: Uuid::new_v4().to_string(),
            scope: scope.to_string(),
        };
        let ring = self.ring()?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(ring.current.kid().to_string());
        let token = encode(&header, &claims, &ring.current.encoding)?;
        Ok((token, claims))
    }

    /// Verify signature, issuer, audience and validity window of a bearer JWT.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims> {
        let header = decode_header(token)
            .map_err(|_| AppError::Authentication("Malformed bearer token".into()))?;
        let kid = header
            .kid
            .ok_or_else(|| AppError::Authentication("Bearer token has no key id".into()))?;

        let ring = self.ring()?;
        let key = ring
            .live(Utc::now(), self.token_ttl())
            .find(|key| key.kid() == kid)
            .ok_or_else(|| AppError::Authentication("Unknown signing key".into()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.settings.client_id]);
        validation.validate_nbf = true;
        validation.leeway = 5;

        decode::<AccessTokenClaims>(token, &key.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::TokenExpired,
                _ => AppError::Authentication(format!("Invalid bearer token: {}", e)),
            })
    }

    /// Resolve a bearer token to the Terraform OIDC context. Tokens removed
    /// from the store are rejected even while their signature is valid.
    pub async fn validate_bearer(&self, ctx: &TxContext, token: &str) -> Result<AuthContext> {
        let claims = self.verify_access_token(token)?;
        if self.store.find_access_token(ctx, &claims.jti).await?.is_none() {
            return Err(AppError::TokenInactive);
        }
        Ok(AuthContext::TerraformOidc {
            scopes: claims.scopes(),
            subject: claims.sub,
        })
    }

    pub async fn userinfo(&self, ctx: &TxContext, token: &str) -> Result<UserInfo> {
        match self.validate_bearer(ctx, token).await? {
            AuthContext::TerraformOidc { subject, .. } => Ok(UserInfo { sub: subject }),
            _ => Err(AppError::Authentication("Invalid bearer token".into())),
        }
    }
}
