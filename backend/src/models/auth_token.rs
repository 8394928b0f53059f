//! Persisted API keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::identifiers::names_match;
use crate::error::{AppError, Result};

pub const MAX_DESCRIPTION_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthTokenType {
    Admin,
    Upload,
    Publish,
}

impl AuthTokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthTokenType::Admin => "admin",
            AuthTokenType::Upload => "upload",
            AuthTokenType::Publish => "publish",
        }
    }
}

impl fmt::Display for AuthTokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthTokenType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(AuthTokenType::Admin),
            "upload" => Ok(AuthTokenType::Upload),
            "publish" => Ok(AuthTokenType::Publish),
            other => Err(AppError::Validation(format!("Unknown token type: {}", other))),
        }
    }
}

/// Stored token. Only the SHA-256 of the token value is persisted.
#[derive(Clone, Serialize)]
pub struct AuthenticationToken {
    pub id: Uuid,
    pub token_type: AuthTokenType,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub description: String,
    pub namespace: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

redacted_debug!(AuthenticationToken {
    show id,
    show token_type,
    redact token_hash,
    show description,
    show namespace,
    show expires_at,
    show active,
});

impl AuthenticationToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// `active ∧ ¬expired`, reported as the specific failure.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.active {
            return Err(AppError::TokenInactive);
        }
        if self.is_expired(now) {
            return Err(AppError::TokenExpired);
        }
        Ok(())
    }

    pub fn can_access_namespace(&self, namespace: &str) -> bool {
        match self.token_type {
            AuthTokenType::Admin | AuthTokenType::Upload => true,
            AuthTokenType::Publish => self
                .namespace
                .as_deref()
                .map(|bound| names_match(bound, namespace))
                .unwrap_or(false),
        }
    }

    pub fn revoke(&mut self) -> Result<()> {
        if !self.active {
            return Err(AppError::AlreadyRevoked);
        }
        self.active = false;
        Ok(())
    }
}

/// Returned once at creation; the plaintext token is never retrievable again.
#[derive(Clone, Serialize)]
pub struct AuthTokenCreated {
    pub id: Uuid,
    pub token: String,
    pub token_type: AuthTokenType,
    pub description: String,
    pub namespace: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

redacted_debug!(AuthTokenCreated {
    show id,
    redact token,
    show token_type,
    show namespace,
    show expires_at,
});
