//! Namespace permission levels and resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Sentinel namespace that matches every namespace.
pub const WILDCARD_NAMESPACE: &str = "*";

/// Totally ordered permission hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionLevel {
    Read = 1,
    Modify = 2,
    Upload = 3,
    Publish = 4,
    Full = 5,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Read => "READ",
            PermissionLevel::Modify => "MODIFY",
            PermissionLevel::Upload => "UPLOAD",
            PermissionLevel::Publish => "PUBLISH",
            PermissionLevel::Full => "FULL",
        }
    }

    /// Whether a stored level satisfies the required one.
    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self >= required
    }

    /// Levels that may be attached to a user group.
    pub fn assignable_to_group(self) -> bool {
        matches!(
            self,
            PermissionLevel::Read | PermissionLevel::Modify | PermissionLevel::Full
        )
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Ok(PermissionLevel::Read),
            "MODIFY" => Ok(PermissionLevel::Modify),
            "UPLOAD" => Ok(PermissionLevel::Upload),
            "PUBLISH" => Ok(PermissionLevel::Publish),
            "FULL" => Ok(PermissionLevel::Full),
            other => Err(AppError::Validation(format!(
                "Unknown permission level: {}",
                other
            ))),
        }
    }
}

/// `hasPermission(stored, required)`.
pub fn has_permission(stored: PermissionLevel, required: PermissionLevel) -> bool {
    stored.satisfies(required)
}

/// Mapping of namespace name to effective permission level.
///
/// Keys keep the casing they were granted with; lookups are case-insensitive
/// and fall back to the `*` wildcard entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespacePermissions(BTreeMap<String, PermissionLevel>);

impl NamespacePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a level, keeping the maximum when the namespace is already present.
    pub fn grant(&mut self, namespace: &str, level: PermissionLevel) {
        let existing_key = self
            .0
            .keys()
            .find(|k| k.eq_ignore_ascii_case(namespace))
            .cloned();
        let key = existing_key.unwrap_or_else(|| namespace.to_string());
        let entry = self.0.entry(key).or_insert(level);
        if level > *entry {
            *entry = level;
        }
    }

    pub fn with(mut self, namespace: &str, level: PermissionLevel) -> Self {
        self.grant(namespace, level);
        self
    }

    /// Effective level for a namespace: the greater of a direct match and the wildcard.
    pub fn resolve(&self, namespace: &str) -> Option<PermissionLevel> {
        let direct = self
            .0
            .iter()
            .filter(|(k, _)| k.as_str() != WILDCARD_NAMESPACE && k.eq_ignore_ascii_case(namespace))
            .map(|(_, v)| *v)
            .max();
        let wildcard = self.0.get(WILDCARD_NAMESPACE).copied();
        direct.max(wildcard)
    }

    pub fn has(&self, namespace: &str, required: PermissionLevel) -> bool {
        self.resolve(namespace)
            .map(|level| has_permission(level, required))
            .unwrap_or(false)
    }

    /// Merges another map, keeping the maximum level per namespace.
    pub fn merge(&mut self, other: &NamespacePermissions) {
        for (ns, level) in &other.0 {
            self.grant(ns, *level);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PermissionLevel)> {
        self.0.iter()
    }

    pub fn get(&self, namespace: &str) -> Option<PermissionLevel> {
        self.0.get(namespace).copied()
    }

    pub fn into_inner(self) -> BTreeMap<String, PermissionLevel> {
        self.0
    }
}

impl FromIterator<(String, PermissionLevel)> for NamespacePermissions {
    fn from_iter<I: IntoIterator<Item = (String, PermissionLevel)>>(iter: I) -> Self {
        let mut perms = NamespacePermissions::new();
        for (ns, level) in iter {
            perms.grant(&ns, level);
        }
        perms
    }
}
