//! Namespace model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::identifiers::validate_namespace_name;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamespaceType {
    /// Owned by an individual user
    User,
    Organisation,
    /// Auto-created from a GitHub login
    GithubUser,
    /// Auto-created from a GitHub organisation membership
    GithubOrg,
}

impl NamespaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceType::User => "user",
            NamespaceType::Organisation => "organisation",
            NamespaceType::GithubUser => "github-user",
            NamespaceType::GithubOrg => "github-org",
        }
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamespaceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(NamespaceType::User),
            "organisation" => Ok(NamespaceType::Organisation),
            "github-user" => Ok(NamespaceType::GithubUser),
            "github-org" => Ok(NamespaceType::GithubOrg),
            other => Err(AppError::Validation(format!("Unknown namespace type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub namespace_type: NamespaceType,
    pub created_at: DateTime<Utc>,
}

impl Namespace {
    pub fn new(name: &str, display_name: Option<String>, namespace_type: NamespaceType) -> Result<Self> {
        validate_namespace_name(name)?;
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            display_name,
            namespace_type,
            created_at: Utc::now(),
        })
    }

    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_type_round_trip() {
        for t in [
            NamespaceType::User,
            NamespaceType::Organisation,
            NamespaceType::GithubUser,
            NamespaceType::GithubOrg,
        ] {
            assert_eq!(t.as_str().parse::<NamespaceType>().unwrap(), t);
        }
    }

    #[test]
    fn test_new_validates_name() {
        assert!(Namespace::new("acme", None, NamespaceType::Organisation).is_ok());
        assert!(Namespace::new("a", None, NamespaceType::Organisation).is_err());
    }

    #[test]
    fn test_display_name_fallback() {
        let ns = Namespace::new("acme", None, NamespaceType::User).unwrap();
        assert_eq!(ns.display(), "acme");
    }
}
