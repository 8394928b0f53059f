//! Login sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, Result};

/// Principal stored in a session's provider-source-auth blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum SessionPrincipal {
    Admin,
    User {
        username: String,
        groups: Vec<String>,
    },
    Github {
        username: String,
        organisations: Vec<String>,
    },
    Saml {
        username: String,
        attributes: BTreeMap<String, Vec<String>>,
    },
    Oidc {
        username: String,
        claims: serde_json::Value,
    },
}

impl SessionPrincipal {
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob)
            .map_err(|e| AppError::Internal(format!("Corrupt session data: {}", e)))
    }
}

#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub expires_at: DateTime<Utc>,
    pub provider_source_auth: Vec<u8>,
    pub csrf_token: String,
    pub created_at: DateTime<Utc>,
}

redacted_debug!(Session {
    redact id,
    show expires_at,
    redact csrf_token,
    show created_at,
});

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn principal(&self) -> Result<SessionPrincipal> {
        SessionPrincipal::from_blob(&self.provider_source_auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_principal_blob_round_trip() {
        let principal = SessionPrincipal::Github {
            username: "alice".into(),
            organisations: vec!["foo".into(), "bar".into()],
        };
        let blob = principal.to_blob().unwrap();
        assert_eq!(SessionPrincipal::from_blob(&blob).unwrap(), principal);
        assert!(SessionPrincipal::from_blob(b"garbage").is_err());
    }

    #[test]
    fn test_expiry_is_strict() {
        let now = Utc::now();
        let session = Session {
            id: "id".into(),
            expires_at: now,
            provider_source_auth: Vec::new(),
            csrf_token: "csrf".into(),
            created_at: now - Duration::minutes(5),
        };
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + Duration::seconds(1)));
    }
}
