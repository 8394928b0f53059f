//! Validated namespace, module and provider names.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 128;

fn module_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*[A-Za-z0-9]$").expect("valid regex"))
}

fn provider_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+$").expect("valid regex"))
}

fn check_length(kind: &str, value: &str) -> Result<()> {
    if value.len() < MIN_NAME_LEN || value.len() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "{} name must be between {} and {} characters: {}",
            kind, MIN_NAME_LEN, MAX_NAME_LEN, value
        )));
    }
    Ok(())
}

pub fn validate_namespace_name(name: &str) -> Result<()> {
    check_length("Namespace", name)?;
    if !module_name_re().is_match(name) {
        return Err(AppError::Validation(format!("Invalid namespace name: {}", name)));
    }
    Ok(())
}

pub fn validate_module_name(name: &str) -> Result<()> {
    check_length("Module", name)?;
    if !module_name_re().is_match(name) {
        return Err(AppError::Validation(format!("Invalid module name: {}", name)));
    }
    Ok(())
}

pub fn validate_provider_name(name: &str) -> Result<()> {
    check_length("Provider", name)?;
    if !provider_name_re().is_match(name) {
        return Err(AppError::Validation(format!("Invalid provider name: {}", name)));
    }
    Ok(())
}

/// Case-insensitive comparison used for namespace and organisation matching.
pub fn names_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// `(namespace, module, provider)` identity of a module provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleProviderId {
    pub namespace: String,
    pub module: String,
    pub provider: String,
}

impl ModuleProviderId {
    /// Builds an id after validating every component.
    pub fn new(namespace: &str, module: &str, provider: &str) -> Result<Self> {
        validate_namespace_name(namespace)?;
        validate_module_name(module)?;
        validate_provider_name(provider)?;
        Ok(Self {
            namespace: namespace.to_string(),
            module: module.to_string(),
            provider: provider.to_string(),
        })
    }

    /// Lower-cased `ns/module/provider`, used as a lookup and lock key.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.namespace.to_lowercase(),
            self.module.to_lowercase(),
            self.provider
        )
    }

    pub fn matches(&self, other: &ModuleProviderId) -> bool {
        names_match(&self.namespace, &other.namespace)
            && names_match(&self.module, &other.module)
            && self.provider == other.provider
    }
}

impl fmt::Display for ModuleProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.module, self.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_names() {
        assert!(validate_module_name("vpc").is_ok());
        assert!(validate_module_name("my-module_2").is_ok());
        assert!(validate_module_name("a").is_err());
        assert!(validate_module_name("-vpc").is_err());
        assert!(validate_module_name("vpc-").is_err());
        assert!(validate_module_name("vpc.net").is_err());
        assert!(validate_module_name(&"a".repeat(129)).is_err());
        assert!(validate_module_name(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_provider_names() {
        assert!(validate_provider_name("aws").is_ok());
        assert!(validate_provider_name("azurerm2").is_ok());
        assert!(validate_provider_name("AWS").is_err());
        assert!(validate_provider_name("aws-x").is_err());
        assert!(validate_provider_name("a").is_err());
    }

    #[test]
    fn test_namespace_names() {
        assert!(validate_namespace_name("Acme-Corp").is_ok());
        assert!(validate_namespace_name("acme corp").is_err());
    }

    #[test]
    fn test_module_provider_id_key_is_case_insensitive() {
        let a = ModuleProviderId::new("Acme", "VPC", "aws").unwrap();
        let b = ModuleProviderId::new("acme", "vpc", "aws").unwrap();
        assert_eq!(a.key(), b.key());
        assert!(a.matches(&b));
        assert_eq!(a.to_string(), "Acme/VPC/aws");
    }
}
