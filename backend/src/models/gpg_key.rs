//! GPG keys attached to a namespace, used for provider signing metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::OnceLock;
use uuid::Uuid;

use regex::Regex;

use crate::error::{AppError, Result};

fn key_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{16}$").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpgKey {
    pub id: Uuid,
    pub namespace: String,
    /// Upper-case 16 hex character long key id.
    pub key_id: String,
    pub ascii_armor: String,
    pub fingerprint: Option<String>,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GpgKey {
    pub fn new(
        namespace: &str,
        key_id: &str,
        ascii_armor: &str,
        fingerprint: Option<String>,
    ) -> Result<Self> {
        let key_id = normalize_key_id(key_id)?;
        if !ascii_armor.contains("BEGIN PGP PUBLIC KEY BLOCK") {
            return Err(AppError::Validation(
                "ascii_armor must contain an armored PGP public key".into(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            key_id,
            ascii_armor: ascii_armor.to_string(),
            fingerprint: fingerprint.map(|f| f.to_uppercase()),
            source: None,
            created_at: Utc::now(),
        })
    }
}

pub fn normalize_key_id(key_id: &str) -> Result<String> {
    let trimmed = key_id.trim();
    if !key_id_re().is_match(trimmed) {
        return Err(AppError::Validation(format!("Invalid GPG key id: {}", key_id)));
    }
    Ok(trimmed.to_uppercase())
}
