//! Artifact storage backends.

pub mod filesystem;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{AppError, Result};
use crate::models::identifiers::ModuleProviderId;
use crate::models::version::Version;

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store content under the given key, replacing any previous content
    async fn put(&self, key: &str, content: Bytes) -> Result<()>;

    /// Retrieve content by key
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete content by key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key below `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// Reject keys that could escape the storage root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(AppError::Storage(format!("Invalid storage key: {}", key)));
    }
    Ok(())
}

/// `<namespace>/<module>/<provider>` prefix of a provider's artifacts.
pub fn provider_prefix(id: &ModuleProviderId) -> String {
    id.key()
}

/// `<namespace>/<module>/<provider>/<version>` prefix of a version's artifacts.
pub fn version_prefix(id: &ModuleProviderId, version: &Version) -> String {
    format!("{}/{}", provider_prefix(id), version)
}

/// Key of the source archive with the given extension.
pub fn archive_key(id: &ModuleProviderId, version: &Version, extension: &str) -> String {
    format!("{}/source.{}", version_prefix(id, version), extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("acme/vpc/aws/1.0.0/source.zip").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("acme//vpc").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_archive_key() {
        let id = ModuleProviderId::new("Acme", "vpc", "aws").unwrap();
        let version = Version::parse("1.2.0-beta").unwrap();
        assert_eq!(
            archive_key(&id, &version, "tar.gz"),
            "acme/vpc/aws/1.2.0-beta/source.tar.gz"
        );
    }
}
