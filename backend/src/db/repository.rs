//! Repository traits consumed by the services.
//!
//! Every method takes the caller's [`TxContext`]; when it carries a
//! transaction the statement runs inside it. Aggregates are loaded and saved
//! whole: `save_module_provider` persists versions, submodules, examples and
//! files in one atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::transaction::{TransactionBackend, TxContext};
use crate::error::Result;
use crate::models::analytics::DownloadEvent;
use crate::models::auth_token::AuthenticationToken;
use crate::models::gpg_key::GpgKey;
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_provider::ModuleProvider;
use crate::models::namespace::{Namespace, NamespaceType};
use crate::models::session::Session;
use crate::models::terraform_idp::{AccessToken, AuthorizationCode, SubjectIdentifier};
use crate::models::user_group::UserGroup;

#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    pub namespace_type: Option<NamespaceType>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleProviderFilter {
    pub namespace: Option<String>,
    pub module: Option<String>,
    pub provider: Option<String>,
    pub verified: Option<bool>,
    /// Only providers with at least one published version.
    pub published_only: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthTokenFilter {
    pub namespace: Option<String>,
    pub active: Option<bool>,
}

#[async_trait]
pub trait NamespaceRepository: Send + Sync {
    /// Case-insensitive lookup by name.
    async fn find_namespace(&self, ctx: &TxContext, name: &str) -> Result<Option<Namespace>>;
    async fn list_namespaces(&self, ctx: &TxContext, filter: &NamespaceFilter)
        -> Result<Vec<Namespace>>;
    async fn save_namespace(&self, ctx: &TxContext, namespace: &Namespace) -> Result<()>;
    async fn delete_namespace(&self, ctx: &TxContext, name: &str) -> Result<bool>;
}

#[async_trait]
pub trait ModuleProviderRepository: Send + Sync {
    /// Loads the whole aggregate. Inside a transaction the provider row is
    /// locked until the transaction ends.
    async fn find_module_provider(
        &self,
        ctx: &TxContext,
        id: &ModuleProviderId,
    ) -> Result<Option<ModuleProvider>>;
    async fn find_module_providers(
        &self,
        ctx: &TxContext,
        filter: &ModuleProviderFilter,
    ) -> Result<Vec<ModuleProvider>>;
    async fn save_module_provider(&self, ctx: &TxContext, provider: &ModuleProvider) -> Result<()>;
    async fn delete_module_provider(&self, ctx: &TxContext, id: &ModuleProviderId)
        -> Result<bool>;
    async fn count_module_providers_in_namespace(&self, ctx: &TxContext, namespace: &str)
        -> Result<i64>;
}

#[async_trait]
pub trait UserGroupRepository: Send + Sync {
    async fn find_user_group(&self, ctx: &TxContext, name: &str) -> Result<Option<UserGroup>>;
    async fn find_user_groups_by_names(
        &self,
        ctx: &TxContext,
        names: &[String],
    ) -> Result<Vec<UserGroup>>;
    async fn list_user_groups(&self, ctx: &TxContext) -> Result<Vec<UserGroup>>;
    async fn save_user_group(&self, ctx: &TxContext, group: &UserGroup) -> Result<()>;
    async fn delete_user_group(&self, ctx: &TxContext, name: &str) -> Result<bool>;
}

#[async_trait]
pub trait AuthTokenRepository: Send + Sync {
    async fn find_token_by_hash(
        &self,
        ctx: &TxContext,
        token_hash: &str,
    ) -> Result<Option<AuthenticationToken>>;
    async fn find_token(&self, ctx: &TxContext, id: Uuid) -> Result<Option<AuthenticationToken>>;
    async fn list_tokens(
        &self,
        ctx: &TxContext,
        filter: &AuthTokenFilter,
    ) -> Result<Vec<AuthenticationToken>>;
    async fn save_token(&self, ctx: &TxContext, token: &AuthenticationToken) -> Result<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find_session(&self, ctx: &TxContext, id: &str) -> Result<Option<Session>>;
    async fn save_session(&self, ctx: &TxContext, session: &Session) -> Result<()>;
    async fn delete_session(&self, ctx: &TxContext, id: &str) -> Result<bool>;
    async fn list_expired_sessions(&self, ctx: &TxContext, now: DateTime<Utc>)
        -> Result<Vec<String>>;
}

#[async_trait]
pub trait TerraformIdpRepository: Send + Sync {
    async fn save_authorization_code(&self, ctx: &TxContext, code: &AuthorizationCode)
        -> Result<()>;
    async fn find_authorization_code(
        &self,
        ctx: &TxContext,
        code: &str,
    ) -> Result<Option<AuthorizationCode>>;
    /// Sets `exchanged_at` only when it is still unset. Returns whether this
    /// call performed the exchange.
    async fn mark_authorization_code_exchanged(
        &self,
        ctx: &TxContext,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_authorization_code(&self, ctx: &TxContext, code: &str) -> Result<bool>;
    async fn list_expired_authorization_codes(
        &self,
        ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn save_access_token(&self, ctx: &TxContext, token: &AccessToken) -> Result<()>;
    async fn find_access_token(&self, ctx: &TxContext, jti: &str) -> Result<Option<AccessToken>>;
    async fn find_access_tokens_for_code(&self, ctx: &TxContext, code: &str)
        -> Result<Vec<AccessToken>>;
    async fn delete_access_token(&self, ctx: &TxContext, jti: &str) -> Result<bool>;
    async fn list_expired_access_tokens(&self, ctx: &TxContext, now: DateTime<Utc>)
        -> Result<Vec<String>>;

    async fn find_subject_identifier(
        &self,
        ctx: &TxContext,
        subject: &str,
        issuer: &str,
        auth_method: &str,
    ) -> Result<Option<SubjectIdentifier>>;
    async fn find_subject_identifier_by_id(
        &self,
        ctx: &TxContext,
        id: Uuid,
    ) -> Result<Option<SubjectIdentifier>>;
    async fn save_subject_identifier(
        &self,
        ctx: &TxContext,
        subject: &SubjectIdentifier,
    ) -> Result<()>;
}

#[async_trait]
pub trait GpgKeyRepository: Send + Sync {
    async fn find_gpg_key_by_key_id(&self, ctx: &TxContext, key_id: &str)
        -> Result<Option<GpgKey>>;
    async fn list_gpg_keys(&self, ctx: &TxContext, namespace: &str) -> Result<Vec<GpgKey>>;
    async fn save_gpg_key(&self, ctx: &TxContext, key: &GpgKey) -> Result<()>;
    async fn delete_gpg_key(&self, ctx: &TxContext, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait AnalyticsRepository: Send + Sync {
    async fn record_download(&self, ctx: &TxContext, event: &DownloadEvent) -> Result<()>;
    async fn count_downloads(&self, ctx: &TxContext, module_version_ids: &[Uuid]) -> Result<i64>;
}

/// Everything the services need from persistence.
pub trait Store:
    TransactionBackend
    + NamespaceRepository
    + ModuleProviderRepository
    + UserGroupRepository
    + AuthTokenRepository
    + SessionRepository
    + TerraformIdpRepository
    + GpgKeyRepository
    + AnalyticsRepository
{
}

impl<T> Store for T where
    T: TransactionBackend
        + NamespaceRepository
        + ModuleProviderRepository
        + UserGroupRepository
        + AuthTokenRepository
        + SessionRepository
        + TerraformIdpRepository
        + GpgKeyRepository
        + AnalyticsRepository
{
}
