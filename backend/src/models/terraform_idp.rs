//! Persistent state of the Terraform OIDC identity provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifetime of an authorization code.
pub const AUTHORIZATION_CODE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "S256")]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "S256" => Some(CodeChallengeMethod::S256),
            "plain" => Some(CodeChallengeMethod::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::S256 => "S256",
            CodeChallengeMethod::Plain => "plain",
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub subject_identifier: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub exchanged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

redacted_debug!(AuthorizationCode {
    redact code,
    show client_id,
    show redirect_uri,
    show scope,
    show code_challenge_method,
    show subject_identifier,
    show expires_at,
    show exchanged_at,
});

impl AuthorizationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_exchanged(&self) -> bool {
        self.exchanged_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessToken {
    /// JWT id (`jti` claim)
    pub jti: String,
    pub authorization_code: String,
    pub subject_identifier: Option<Uuid>,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Stable identity of a principal that logged in through the IdP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectIdentifier {
    pub id: Uuid,
    pub subject: String,
    pub issuer: String,
    pub auth_method: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
