//! Namespace, module provider and version administration, plus the
//! download locations handed to Terraform.

use std::sync::Arc;

use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;

use crate::config::Config;
use crate::db::repository::{
    GpgKeyRepository, ModuleProviderFilter, ModuleProviderRepository, NamespaceFilter,
    NamespaceRepository, UserGroupRepository,
};
use crate::db::{with_transaction, Store, TxContext};
use crate::error::{AppError, Result};
use crate::models::gpg_key::{normalize_key_id, GpgKey};
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_provider::{GitConfig, ModuleProvider};
use crate::models::module_version::ModuleVersion;
use crate::models::namespace::{Namespace, NamespaceType};
use crate::models::permission::PermissionLevel;
use crate::models::user_group::UserGroup;
use crate::models::version::Version;
use crate::services::archive_service::ArchiveService;
use crate::services::auth_context::AuthContext;
use crate::services::git_service::tag_for_version;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a signed archive URL.
const DOWNLOAD_URL_TTL_SECS: i64 = 3600;

/// Archive extensions in order of preference for Terraform downloads.
const DOWNLOAD_EXTENSIONS: [&str; 2] = ["zip", "tar.gz"];

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNamespaceRequest {
    pub name: String,
    pub display_name: Option<String>,
    #[serde(default = "default_namespace_type")]
    pub namespace_type: NamespaceType,
}

fn default_namespace_type() -> NamespaceType {
    NamespaceType::Organisation
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddGpgKeyRequest {
    pub key_id: String,
    pub ascii_armor: String,
    pub fingerprint: Option<String>,
    pub source: Option<String>,
}

pub struct ModuleService {
    store: Arc<dyn Store>,
    archives: Arc<ArchiveService>,
    signing_key: Vec<u8>,
}

impl ModuleService {
    pub fn new(config: &Config, store: Arc<dyn Store>, archives: Arc<ArchiveService>) -> Self {
        let signing_key = if config.secret_key.is_empty() {
            tracing::warn!("SECRET_KEY is not set, download URLs will not survive a restart");
            let mut key = vec![0u8; 32];
            rand::rng().fill_bytes(&mut key);
            key
        } else {
            config.secret_key.as_bytes().to_vec()
        };
        Self {
            store,
            archives,
            signing_key,
        }
    }

    // Namespaces

    pub async fn create_namespace(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        request: CreateNamespaceRequest,
    ) -> Result<Namespace> {
        auth.require_admin()?;
        if self.store.find_namespace(ctx, &request.name).await?.is_some() {
            return Err(AppError::AlreadyExists(format!(
                "Namespace {} already exists",
                request.name
            )));
        }
        let display_name = request
            .display_name
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        let namespace = Namespace::new(&request.name, display_name, request.namespace_type)?;
        self.store.save_namespace(ctx, &namespace).await?;
        tracing::info!(namespace = %namespace.name, "Created namespace");
        Ok(namespace)
    }

    pub async fn get_namespace(&self, ctx: &TxContext, name: &str) -> Result<Namespace> {
        self.store
            .find_namespace(ctx, name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Namespace {} not found", name)))
    }

    pub async fn list_namespaces(&self, ctx: &TxContext, filter: &NamespaceFilter) -> Result<Vec<Namespace>> {
        self.store.list_namespaces(ctx, filter).await
    }

    /// Delete an empty namespace along with its GPG keys.
    pub async fn delete_namespace(&self, auth: &AuthContext, ctx: &TxContext, name: &str) -> Result<()> {
        auth.require_admin()?;
        let store = self.store.as_ref();
        with_transaction(store, ctx, "delete_namespace", |tx| async move {
            let namespace = self.get_namespace(&tx, name).await?;
            let providers = store.count_module_providers_in_namespace(&tx, &namespace.name).await?;
            if providers > 0 {
                return Err(AppError::DomainViolation(format!(
                    "Namespace {} still contains {} module provider(s)",
                    namespace.name, providers
                )));
            }
            for key in store.list_gpg_keys(&tx, &namespace.name).await? {
                store.delete_gpg_key(&tx, key.id).await?;
            }
            store.delete_namespace(&tx, &namespace.name).await?;
            tracing::info!(namespace = %namespace.name, "Deleted namespace");
            Ok(())
        })
        .await
    }

    // GPG keys

    pub async fn add_gpg_key(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        namespace: &str,
        request: AddGpgKeyRequest,
    ) -> Result<GpgKey> {
        let namespace = self.get_namespace(ctx, namespace).await?;
        if !auth.check_namespace_access(PermissionLevel::Modify, &namespace.name) {
            return Err(auth.deny("manage GPG keys of this namespace"));
        }
        let mut key = GpgKey::new(
            &namespace.name,
            &request.key_id,
            &request.ascii_armor,
            request.fingerprint,
        )?;
        key.source = request.source;
        if self.store.find_gpg_key_by_key_id(ctx, &key.key_id).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("GPG key {} already exists", key.key_id)));
        }
        self.store.save_gpg_key(ctx, &key).await?;
        tracing::info!(namespace = %namespace.name, key_id = %key.key_id, "Added GPG key");
        Ok(key)
    }

    pub async fn list_gpg_keys(&self, ctx: &TxContext, namespace: &str) -> Result<Vec<GpgKey>> {
        let namespace = self.get_namespace(ctx, namespace).await?;
        self.store.list_gpg_keys(ctx, &namespace.name).await
    }

    pub async fn find_gpg_key(&self, ctx: &TxContext, key_id: &str) -> Result<GpgKey> {
        let key_id = normalize_key_id(key_id)?;
        self.store
            .find_gpg_key_by_key_id(ctx, &key_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("GPG key {} not found", key_id)))
    }

    pub async fn delete_gpg_key(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        namespace: &str,
        key_id: &str,
    ) -> Result<()> {
        let key = self.find_gpg_key(ctx, key_id).await?;
        if !key.namespace.eq_ignore_ascii_case(namespace) {
            return Err(AppError::NotFound(format!(
                "GPG key {} not found in namespace {}",
                key.key_id, namespace
            )));
        }
        if !auth.check_namespace_access(PermissionLevel::Modify, &key.namespace) {
            return Err(auth.deny("manage GPG keys of this namespace"));
        }
        self.store.delete_gpg_key(ctx, key.id).await?;
        tracing::info!(namespace = %key.namespace, key_id = %key.key_id, "Deleted GPG key");
        Ok(())
    }

    // User groups

    pub async fn create_user_group(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        name: &str,
        site_admin: bool,
    ) -> Result<UserGroup> {
        auth.require_admin()?;
        let group = UserGroup::new(name, site_admin)?;
        if self.store.find_user_group(ctx, &group.name).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("User group {} already exists", group.name)));
        }
        self.store.save_user_group(ctx, &group).await?;
        tracing::info!(group = %group.name, site_admin, "Created user group");
        Ok(group)
    }

    pub async fn list_user_groups(&self, auth: &AuthContext, ctx: &TxContext) -> Result<Vec<UserGroup>> {
        auth.require_admin()?;
        self.store.list_user_groups(ctx).await
    }

    pub async fn delete_user_group(&self, auth: &AuthContext, ctx: &TxContext, name: &str) -> Result<()> {
        auth.require_admin()?;
        if !self.store.delete_user_group(ctx, name).await? {
            return Err(AppError::NotFound(format!("User group {} not found", name)));
        }
        tracing::info!(group = %name, "Deleted user group");
        Ok(())
    }

    pub async fn set_group_permission(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        group: &str,
        namespace: &str,
        level: PermissionLevel,
    ) -> Result<UserGroup> {
        auth.require_admin()?;
        let namespace = self.get_namespace(ctx, namespace).await?;
        let store = self.store.as_ref();
        with_transaction(store, ctx, "set_group_permission", |tx| async move {
            let mut found = store
                .find_user_group(&tx, group)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("User group {} not found", group)))?;
            found.set_permission(&namespace.name, level)?;
            store.save_user_group(&tx, &found).await?;
            tracing::info!(group = %found.name, namespace = %namespace.name, level = level.as_str(), "Granted namespace permission");
            Ok(found)
        })
        .await
    }

    pub async fn remove_group_permission(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        group: &str,
        namespace: &str,
    ) -> Result<UserGroup> {
        auth.require_admin()?;
        let store = self.store.as_ref();
        with_transaction(store, ctx, "remove_group_permission", |tx| async move {
            let mut found = store
                .find_user_group(&tx, group)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("User group {} not found", group)))?;
            if !found.remove_permission(namespace) {
                return Err(AppError::NotFound(format!(
                    "User group {} has no permission on {}",
                    group, namespace
                )));
            }
            store.save_user_group(&tx, &found).await?;
            Ok(found)
        })
        .await
    }

    // Module providers

    pub async fn get_module_provider(&self, ctx: &TxContext, ident: &ModuleProviderId) -> Result<ModuleProvider> {
        self.store
            .find_module_provider(ctx, ident)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Module provider {} not found", ident)))
    }

    pub async fn list_module_providers(
        &self,
        ctx: &TxContext,
        filter: &ModuleProviderFilter,
    ) -> Result<Vec<ModuleProvider>> {
        self.store.find_module_providers(ctx, filter).await
    }

    pub async fn create_module_provider(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        ident: ModuleProviderId,
        git: GitConfig,
    ) -> Result<ModuleProvider> {
        let namespace = self.get_namespace(ctx, &ident.namespace).await?;
        if !auth.check_namespace_access(PermissionLevel::Modify, &namespace.name) {
            return Err(auth.deny("create module providers in this namespace"));
        }
        let ident = ModuleProviderId::new(&namespace.name, &ident.module, &ident.provider)?;
        let store = self.store.as_ref();
        let provider = with_transaction(store, ctx, "create_module_provider", |tx| async move {
            if store.find_module_provider(&tx, &ident).await?.is_some() {
                return Err(AppError::AlreadyExists(format!("Module provider {} already exists", ident)));
            }
            let provider = ModuleProvider::new(ident, git);
            store.save_module_provider(&tx, &provider).await?;
            Ok(provider)
        })
        .await?;
        tracing::info!(module = %provider.ident, "Created module provider");
        Ok(provider)
    }

    pub async fn update_git_config(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        ident: &ModuleProviderId,
        git: GitConfig,
    ) -> Result<ModuleProvider> {
        if !auth.check_namespace_access(PermissionLevel::Modify, &ident.namespace) {
            return Err(auth.deny("modify this module provider"));
        }
        self.modify_provider(ctx, ident, "update_git_config", move |provider| {
            provider.git = git;
            Ok(())
        })
        .await
    }

    /// Delete a provider, its versions and their archives.
    pub async fn delete_module_provider(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        ident: &ModuleProviderId,
    ) -> Result<()> {
        if !auth.check_namespace_access(PermissionLevel::Full, &ident.namespace) {
            return Err(auth.deny("delete this module provider"));
        }
        let provider = self.get_module_provider(ctx, ident).await?;
        self.store.delete_module_provider(ctx, &provider.ident).await?;
        if let Err(e) = self.archives.delete_provider(&provider.ident).await {
            tracing::warn!(module = %provider.ident, error = %e, "Failed to remove provider archives");
        }
        tracing::info!(module = %provider.ident, versions = provider.version_count(), "Deleted module provider");
        Ok(())
    }

    pub async fn set_verified(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        ident: &ModuleProviderId,
        verified: bool,
    ) -> Result<ModuleProvider> {
        auth.require_admin()?;
        self.modify_provider(ctx, ident, "set_verified", move |provider| {
            if verified {
                provider.verify()
            } else {
                provider.unverify();
                Ok(())
            }
        })
        .await
    }

    pub async fn publish_version(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        ident: &ModuleProviderId,
        version: &Version,
    ) -> Result<ModuleProvider> {
        if !auth.can_publish_module_version(&ident.namespace) {
            return Err(auth.deny("publish module versions in this namespace"));
        }
        let provider = self
            .modify_provider(ctx, ident, "publish_version", |provider| {
                provider.publish_version(version, Utc::now())
            })
            .await?;
        tracing::info!(
            module = %provider.ident,
            version = %version,
            latest = ?provider.latest_version().map(|v| v.version.to_string()),
            "Published module version"
        );
        Ok(provider)
    }

    /// Remove a version; the latest version is re-derived.
    pub async fn delete_version(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        ident: &ModuleProviderId,
        version: &Version,
    ) -> Result<ModuleProvider> {
        if !auth.check_namespace_access(PermissionLevel::Modify, &ident.namespace) {
            return Err(auth.deny("delete module versions in this namespace"));
        }
        let removed: std::sync::Mutex<Option<ModuleVersion>> = std::sync::Mutex::new(None);
        let slot = &removed;
        let provider = self
            .modify_provider(ctx, ident, "delete_version", move |provider| {
                let version = provider.remove_version(version)?;
                *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(version);
                Ok(())
            })
            .await?;
        let removed = removed
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(removed) = removed {
            if let Err(e) = self.archives.delete(&removed.archive).await {
                tracing::warn!(module = %provider.ident, version = %version, error = %e, "Failed to remove version archives");
            }
        }
        tracing::info!(module = %provider.ident, version = %version, "Deleted module version");
        Ok(provider)
    }

    /// Load the aggregate under lock, apply `change` and save it.
    async fn modify_provider<F>(
        &self,
        ctx: &TxContext,
        ident: &ModuleProviderId,
        label: &str,
        change: F,
    ) -> Result<ModuleProvider>
    where
        F: FnOnce(&mut ModuleProvider) -> Result<()> + Send,
    {
        let store = self.store.as_ref();
        with_transaction(store, ctx, label, |tx| async move {
            let mut provider = store
                .find_module_provider(&tx, ident)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Module provider {} not found", ident)))?;
            change(&mut provider)?;
            store.save_module_provider(&tx, &provider).await?;
            Ok(provider)
        })
        .await
    }

    // Downloads

    fn signature(&self, path: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| AppError::Internal(format!("Invalid signing key: {}", e)))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Signed archive URL, or a `git::` source for externally hosted
    /// modules whose archives were not generated.
    pub fn download_location(&self, provider: &ModuleProvider, version: &ModuleVersion) -> Result<String> {
        if let Some(ext) = DOWNLOAD_EXTENSIONS
            .iter()
            .find(|ext| version.archive.key_for(ext).is_some())
        {
            let path = archive_path(&provider.ident, &version.version, ext);
            let expires = (Utc::now() + Duration::seconds(DOWNLOAD_URL_TTL_SECS)).timestamp();
            let signature = hex::encode(self.signature(&path, expires)?.finalize().into_bytes());
            return Ok(format!("{}?expires={}&signature={}", path, expires, signature));
        }

        let clone_url = provider.clone_url(Some(version)).ok_or_else(|| {
            AppError::NotFound(format!(
                "No source archive for {} {}",
                provider.ident, version.version
            ))
        })?;
        let tag = match &version.git_tag {
            Some(tag) => tag.clone(),
            None => tag_for_version(&provider.git.git_tag_format, &version.version)?,
        };
        let path = version
            .git_path
            .as_deref()
            .or(provider.git.git_path.as_deref())
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty() && *p != ".")
            .map(|p| format!("//{}", p))
            .unwrap_or_default();
        Ok(format!(
            "git::{}{}?ref={}",
            clone_url,
            path,
            urlencoding::encode(&tag)
        ))
    }

    /// Check the signature of an archive URL.
    pub fn verify_download(&self, path: &str, expires: i64, signature: &str) -> Result<()> {
        if Utc::now().timestamp() > expires {
            return Err(AppError::Authorization("Download link has expired".into()));
        }
        let provided = hex::decode(signature)
            .map_err(|_| AppError::Authorization("Invalid download signature".into()))?;
        self.signature(path, expires)?
            .verify_slice(&provided)
            .map_err(|_| AppError::Authorization("Invalid download signature".into()))
    }

    /// Archive bytes of a published version.
    pub async fn read_archive(
        &self,
        ctx: &TxContext,
        ident: &ModuleProviderId,
        version: &Version,
        extension: &str,
    ) -> Result<bytes::Bytes> {
        let provider = self.get_module_provider(ctx, ident).await?;
        let found = provider
            .get_version(version)
            .ok_or_else(|| AppError::NotFound(format!("Version {} of {} not found", version, ident)))?;
        let key = found
            .archive
            .key_for(extension)
            .ok_or_else(|| AppError::NotFound(format!("No {} archive for {} {}", extension, ident, version)))?;
        self.archives.read(key).await
    }
}

/// Path of the archive endpoint for a version.
pub fn archive_path(ident: &ModuleProviderId, version: &Version, extension: &str) -> String {
    format!(
        "/v1/terrareg/modules/{}/{}/{}/{}/source.{}",
        ident.namespace, ident.module, ident.provider, version, extension
    )
}
