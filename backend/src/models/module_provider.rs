//! Module provider aggregate root.
//!
//! A provider exclusively owns its versions. Versions never point back at the
//! provider; anything that needs the provider (latest-version derivation,
//! URL templates) goes through the aggregate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identifiers::ModuleProviderId;
use super::module_version::ModuleVersion;
use super::version::Version;
use crate::error::{AppError, Result};

/// Git configuration of a module provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitConfig {
    pub repo_base_url_template: Option<String>,
    pub repo_clone_url_template: Option<String>,
    pub repo_browse_url_template: Option<String>,
    /// Template with `{version}`, `{major}`, `{minor}`, `{patch}` or `{build}`.
    pub git_tag_format: String,
    /// Sub-directory of the repository containing the module.
    pub git_path: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_base_url_template: None,
            repo_clone_url_template: None,
            repo_browse_url_template: None,
            git_tag_format: "{version}".to_string(),
            git_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleProvider {
    pub id: Uuid,
    pub ident: ModuleProviderId,
    pub verified: bool,
    pub git: GitConfig,
    versions: BTreeMap<Version, ModuleVersion>,
    latest_version: Option<Version>,
    pub created_at: DateTime<Utc>,
}

impl ModuleProvider {
    pub fn new(ident: ModuleProviderId, git: GitConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            ident,
            verified: false,
            git,
            versions: BTreeMap::new(),
            latest_version: None,
            created_at: Utc::now(),
        }
    }

    /// Rebuild an aggregate from persisted parts.
    pub fn restore(
        id: Uuid,
        ident: ModuleProviderId,
        verified: bool,
        git: GitConfig,
        versions: Vec<ModuleVersion>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut provider = Self {
            id,
            ident,
            verified,
            git,
            versions: versions
                .into_iter()
                .map(|v| (v.version.clone(), v))
                .collect(),
            latest_version: None,
            created_at,
        };
        provider.recompute_latest();
        provider
    }

    pub fn versions(&self) -> impl DoubleEndedIterator<Item = &ModuleVersion> {
        self.versions.values()
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Versions visible to Terraform clients.
    pub fn published_versions(&self) -> impl DoubleEndedIterator<Item = &ModuleVersion> {
        self.versions.values().filter(|v| v.published)
    }

    pub fn get_version(&self, version: &Version) -> Option<&ModuleVersion> {
        self.versions.get(version)
    }

    pub fn get_version_mut(&mut self, version: &Version) -> Option<&mut ModuleVersion> {
        self.versions.get_mut(version)
    }

    pub fn latest_version(&self) -> Option<&ModuleVersion> {
        self.latest_version
            .as_ref()
            .and_then(|v| self.versions.get(v))
    }

    pub fn add_version(&mut self, version: ModuleVersion) -> Result<()> {
        if self.versions.contains_key(&version.version) {
            return Err(AppError::AlreadyExists(format!(
                "Version {} already exists for {}",
                version.version, self.ident
            )));
        }
        if version.published && version.published_at.is_none() {
            return Err(AppError::DomainViolation(
                "Published versions must carry a publish timestamp".into(),
            ));
        }
        self.versions.insert(version.version.clone(), version);
        self.recompute_latest();
        Ok(())
    }

    pub fn publish_version(&mut self, version: &Version, now: DateTime<Utc>) -> Result<()> {
        let entry = self.versions.get_mut(version).ok_or_else(|| {
            AppError::NotFound(format!("Version {} of {}", version, self.ident))
        })?;
        if entry.published {
            return Err(AppError::DomainViolation(format!(
                "Version {} of {} is already published",
                version, self.ident
            )));
        }
        entry.published = true;
        entry.published_at = Some(now);
        self.recompute_latest();
        Ok(())
    }

    pub fn remove_version(&mut self, version: &Version) -> Result<ModuleVersion> {
        let removed = self.versions.remove(version).ok_or_else(|| {
            AppError::NotFound(format!("Version {} of {}", version, self.ident))
        })?;
        self.recompute_latest();
        Ok(removed)
    }

    pub fn verify(&mut self) -> Result<()> {
        if self.verified {
            return Err(AppError::DomainViolation(format!(
                "{} is already verified",
                self.ident
            )));
        }
        self.verified = true;
        Ok(())
    }

    pub fn unverify(&mut self) {
        self.verified = false;
    }

    /// Greatest published, non-beta version.
    pub fn recompute_latest(&mut self) {
        self.latest_version = self
            .versions
            .values()
            .rev()
            .find(|v| v.is_latest_candidate())
            .map(|v| v.version.clone());
    }

    pub fn is_externally_hosted(&self) -> bool {
        self.git
            .repo_clone_url_template
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }

    fn expand_template(&self, template: &str) -> String {
        template
            .replace("{namespace}", &self.ident.namespace)
            .replace("{module}", &self.ident.module)
            .replace("{provider}", &self.ident.provider)
    }

    /// Clone URL for a version, honouring the version's own override.
    pub fn clone_url(&self, version: Option<&ModuleVersion>) -> Option<String> {
        version
            .and_then(|v| v.url_overrides.repo_clone_url_template.as_deref())
            .or(self.git.repo_clone_url_template.as_deref())
            .filter(|t| !t.trim().is_empty())
            .map(|t| self.expand_template(t))
    }

    pub fn base_url(&self, version: Option<&ModuleVersion>) -> Option<String> {
        version
            .and_then(|v| v.url_overrides.repo_base_url_template.as_deref())
            .or(self.git.repo_base_url_template.as_deref())
            .filter(|t| !t.trim().is_empty())
            .map(|t| self.expand_template(t))
    }

    /// Browse URL for a file in a version (`{tag}` and `{path}` placeholders).
    pub fn browse_url(&self, version: &ModuleVersion, path: &str) -> Option<String> {
        let template = version
            .url_overrides
            .repo_browse_url_template
            .as_deref()
            .or(self.git.repo_browse_url_template.as_deref())
            .filter(|t| !t.trim().is_empty())?;
        let tag = version
            .git_tag
            .clone()
            .unwrap_or_else(|| version.version.to_string());
        Some(
            self.expand_template(template)
                .replace("{tag}", &tag)
                .replace("{path}", path),
        )
    }

    /// Terraform snippet for consuming a version from this registry.
    pub fn usage_example(&self, host: &str, version: &ModuleVersion) -> String {
        let mut lines = Vec::new();
        if version.beta() {
            lines.push(
                "# This version of the module is a beta version.".to_string(),
            );
            lines.push(
                "# To use this version, it must be pinned in Terraform".to_string(),
            );
        }
        if !version.published {
            lines.push(
                "# This version of this module has not yet been published,".to_string(),
            );
            lines.push("# meaning that it cannot yet be used by Terraform".to_string());
        }
        let block_name = self.ident.module.replace('-', "_");
        lines.push(format!("module \"{}\" {{", block_name));
        lines.push(format!(
            "  source  = \"{}/{}/{}/{}\"",
            host, self.ident.namespace, self.ident.module, self.ident.provider
        ));
        lines.push(format!("  version = \"{}\"", version.version));
        lines.push("}".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ModuleProvider {
        ModuleProvider::new(
            ModuleProviderId::new("acme", "vpc", "aws").unwrap(),
            GitConfig::default(),
        )
    }

    fn version(v: &str) -> ModuleVersion {
        ModuleVersion::new(Version::parse(v).unwrap())
    }

    fn published(v: &str) -> ModuleVersion {
        let mut mv = version(v);
        mv.published = true;
        mv.published_at = Some(Utc::now());
        mv
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut p = provider();
        p.add_version(version("1.0.0")).unwrap();
        let err = p.add_version(version("1.0.0")).unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
        p.add_version(version("1.0.0-beta")).unwrap();
        assert_eq!(p.version_count(), 2);
    }

    #[test]
    fn test_latest_ignores_beta_and_unpublished() {
        let mut p = provider();
        p.add_version(published("1.2.3")).unwrap();
        p.add_version(published("1.3.0-beta")).unwrap();
        p.add_version(version("2.0.0")).unwrap();
        assert_eq!(p.latest_version().unwrap().version.to_string(), "1.2.3");

        p.publish_version(&Version::parse("2.0.0").unwrap(), Utc::now())
            .unwrap();
        assert_eq!(p.latest_version().unwrap().version.to_string(), "2.0.0");
    }

    #[test]
    fn test_no_latest_without_candidates() {
        let mut p = provider();
        p.add_version(published("1.0.0-rc1")).unwrap();
        assert!(p.latest_version().is_none());
    }

    #[test]
    fn test_republish_is_domain_violation() {
        let mut p = provider();
        p.add_version(version("1.0.0")).unwrap();
        let v = Version::parse("1.0.0").unwrap();
        p.publish_version(&v, Utc::now()).unwrap();
        assert!(p.get_version(&v).unwrap().published_at.is_some());
        let err = p.publish_version(&v, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::DomainViolation(_)));
    }

    #[test]
    fn test_published_without_timestamp_rejected() {
        let mut p = provider();
        let mut mv = version("1.0.0");
        mv.published = true;
        assert!(matches!(
            p.add_version(mv).unwrap_err(),
            AppError::DomainViolation(_)
        ));
    }

    #[test]
    fn test_remove_version_rederives_latest() {
        let mut p = provider();
        p.add_version(published("1.0.0")).unwrap();
        p.add_version(published("1.1.0")).unwrap();
        p.remove_version(&Version::parse("1.1.0").unwrap()).unwrap();
        assert_eq!(p.latest_version().unwrap().version.to_string(), "1.0.0");
    }

    #[test]
    fn test_verify_twice_fails_unverify_idempotent() {
        let mut p = provider();
        p.verify().unwrap();
        assert!(p.verify().is_err());
        p.unverify();
        p.unverify();
        assert!(!p.verified);
    }

    #[test]
    fn test_url_templates() {
        let mut p = provider();
        p.git.repo_clone_url_template =
            Some("ssh://git@example.com/{namespace}/{module}-{provider}.git".into());
        p.git.repo_browse_url_template =
            Some("https://example.com/{namespace}/{module}/tree/{tag}/{path}".into());
        let mut mv = version("1.0.0");
        mv.git_tag = Some("v1.0.0".into());
        assert!(p.is_externally_hosted());
        assert_eq!(
            p.clone_url(Some(&mv)).unwrap(),
            "ssh://git@example.com/acme/vpc-aws.git"
        );
        assert_eq!(
            p.browse_url(&mv, "main.tf").unwrap(),
            "https://example.com/acme/vpc/tree/v1.0.0/main.tf"
        );

        mv.url_overrides.repo_clone_url_template = Some("https://other/{module}.git".into());
        assert_eq!(p.clone_url(Some(&mv)).unwrap(), "https://other/vpc.git");
    }

    #[test]
    fn test_usage_example() {
        let p = provider();
        let snippet = p.usage_example("registry.example.com", &published("1.2.3"));
        assert_eq!(
            snippet,
            "module \"vpc\" {\n  source  = \"registry.example.com/acme/vpc/aws\"\n  version = \"1.2.3\"\n}"
        );

        let beta = p.usage_example("registry.example.com", &version("1.3.0-beta"));
        assert!(beta.starts_with("# This version of the module is a beta version."));
        assert!(beta.contains("has not yet been published"));
    }
}
