//! In-process store.
//!
//! Used by tests and by `STORE_BACKEND=memory`. Transactions are serialised
//! through a single writer lock and implemented with whole-state snapshots:
//! a savepoint pushes a snapshot, rolling back restores it. Reads outside a
//! transaction may observe uncommitted writes.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::repository::{
    AnalyticsRepository, AuthTokenFilter, AuthTokenRepository, GpgKeyRepository,
    ModuleProviderFilter, ModuleProviderRepository, NamespaceFilter, NamespaceRepository,
    SessionRepository, TerraformIdpRepository, UserGroupRepository,
};
use super::transaction::{SqlDialect, TransactionBackend, TransactionHandle, TxContext};
use crate::error::{AppError, Result};
use crate::models::analytics::DownloadEvent;
use crate::models::auth_token::AuthenticationToken;
use crate::models::gpg_key::GpgKey;
use crate::models::identifiers::{names_match, ModuleProviderId};
use crate::models::module_provider::ModuleProvider;
use crate::models::namespace::Namespace;
use crate::models::session::Session;
use crate::models::terraform_idp::{AccessToken, AuthorizationCode, SubjectIdentifier};
use crate::models::user_group::UserGroup;

#[derive(Clone, Default)]
struct MemoryState {
    namespaces: BTreeMap<String, Namespace>,
    providers: BTreeMap<String, ModuleProvider>,
    user_groups: BTreeMap<String, UserGroup>,
    tokens: HashMap<Uuid, AuthenticationToken>,
    sessions: HashMap<String, Session>,
    authorization_codes: HashMap<String, AuthorizationCode>,
    access_tokens: HashMap<String, AccessToken>,
    subject_identifiers: HashMap<Uuid, SubjectIdentifier>,
    gpg_keys: HashMap<Uuid, GpgKey>,
    downloads: Vec<DownloadEvent>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<StdMutex<MemoryState>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("Memory store lock poisoned".into()))
    }

    fn read<R>(&self, f: impl FnOnce(&MemoryState) -> R) -> Result<R> {
        let state = self.lock()?;
        Ok(f(&state))
    }

    /// Writes outside a transaction take the writer lock for their duration.
    async fn write<R>(
        &self,
        ctx: &TxContext,
        f: impl FnOnce(&mut MemoryState) -> Result<R>,
    ) -> Result<R> {
        let _writer = if ctx.is_in_transaction() {
            None
        } else {
            Some(self.writer.lock().await)
        };
        let mut state = self.lock()?;
        f(&mut state)
    }

    /// Number of stored download events.
    pub fn download_count(&self) -> usize {
        self.read(|s| s.downloads.len()).unwrap_or(0)
    }
}

struct MemoryTransaction {
    state: Arc<StdMutex<MemoryState>>,
    initial: MemoryState,
    savepoints: Vec<(String, MemoryState)>,
    _writer: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn snapshot(&self) -> Result<MemoryState> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| AppError::Internal("Memory store lock poisoned".into()))
    }

    fn restore(&self, snapshot: MemoryState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::Internal("Memory store lock poisoned".into()))?;
        *state = snapshot;
        Ok(())
    }
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    async fn savepoint(&mut self, name: &str) -> Result<()> {
        let snapshot = self.snapshot()?;
        self.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| AppError::Internal(format!("Unknown savepoint {}", name)))?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| AppError::Internal(format!("Unknown savepoint {}", name)))?;
        let snapshot = self.savepoints[position].1.clone();
        self.savepoints.truncate(position + 1);
        self.restore(snapshot)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let initial = self.initial.clone();
        self.restore(initial)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl TransactionBackend for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn TransactionHandle>> {
        let writer = self.writer.clone().lock_owned().await;
        let initial = self.lock()?.clone();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            initial,
            savepoints: Vec::new(),
            _writer: writer,
        }))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Memory
    }
}

#[async_trait]
impl NamespaceRepository for MemoryStore {
    async fn find_namespace(&self, _ctx: &TxContext, name: &str) -> Result<Option<Namespace>> {
        self.read(|s| s.namespaces.get(&name.to_lowercase()).cloned())
    }

    async fn list_namespaces(
        &self,
        _ctx: &TxContext,
        filter: &NamespaceFilter,
    ) -> Result<Vec<Namespace>> {
        self.read(|s| {
            s.namespaces
                .values()
                .filter(|ns| {
                    filter
                        .namespace_type
                        .map(|t| ns.namespace_type == t)
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        })
    }

    async fn save_namespace(&self, ctx: &TxContext, namespace: &Namespace) -> Result<()> {
        let namespace = namespace.clone();
        self.write(ctx, move |s| {
            let key = namespace.name.to_lowercase();
            if let Some(existing) = s.namespaces.get(&key) {
                if existing.id != namespace.id {
                    return Err(AppError::AlreadyExists(format!(
                        "Namespace {} already exists",
                        namespace.name
                    )));
                }
            }
            s.namespaces.insert(key, namespace);
            Ok(())
        })
        .await
    }

    async fn delete_namespace(&self, ctx: &TxContext, name: &str) -> Result<bool> {
        let key = name.to_lowercase();
        self.write(ctx, move |s| {
            let removed = s.namespaces.remove(&key).is_some();
            if removed {
                s.gpg_keys.retain(|_, k| !names_match(&k.namespace, &key));
            }
            Ok(removed)
        })
        .await
    }
}

fn provider_matches(provider: &ModuleProvider, filter: &ModuleProviderFilter) -> bool {
    let ident = &provider.ident;
    filter
        .namespace
        .as_deref()
        .map(|ns| names_match(ns, &ident.namespace))
        .unwrap_or(true)
        && filter
            .module
            .as_deref()
            .map(|m| names_match(m, &ident.module))
            .unwrap_or(true)
        && filter
            .provider
            .as_deref()
            .map(|p| p == ident.provider)
            .unwrap_or(true)
        && filter.verified.map(|v| v == provider.verified).unwrap_or(true)
        && (!filter.published_only || provider.published_versions().next().is_some())
}

#[async_trait]
impl ModuleProviderRepository for MemoryStore {
    async fn find_module_provider(
        &self,
        _ctx: &TxContext,
        id: &ModuleProviderId,
    ) -> Result<Option<ModuleProvider>> {
        self.read(|s| s.providers.get(&id.key()).cloned())
    }

    async fn find_module_providers(
        &self,
        _ctx: &TxContext,
        filter: &ModuleProviderFilter,
    ) -> Result<Vec<ModuleProvider>> {
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        self.read(|s| {
            s.providers
                .values()
                .filter(|p| provider_matches(p, filter))
                .skip(offset)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn save_module_provider(&self, ctx: &TxContext, provider: &ModuleProvider) -> Result<()> {
        let provider = provider.clone();
        self.write(ctx, move |s| {
            if !s
                .namespaces
                .contains_key(&provider.ident.namespace.to_lowercase())
            {
                return Err(AppError::NotFound(format!(
                    "Namespace {}",
                    provider.ident.namespace
                )));
            }
            let key = provider.ident.key();
            if let Some(existing) = s.providers.get(&key) {
                if existing.id != provider.id {
                    return Err(AppError::AlreadyExists(format!(
                        "Module provider {} already exists",
                        provider.ident
                    )));
                }
                // Drop analytics of versions no longer part of the aggregate.
                let kept: Vec<Uuid> = provider.versions().map(|v| v.id).collect();
                let removed: Vec<Uuid> = existing
                    .versions()
                    .map(|v| v.id)
                    .filter(|id| !kept.contains(id))
                    .collect();
                s.downloads
                    .retain(|d| !removed.contains(&d.module_version_id));
            }
            s.providers.insert(key, provider);
            Ok(())
        })
        .await
    }

    async fn delete_module_provider(&self, ctx: &TxContext, id: &ModuleProviderId) -> Result<bool> {
        let key = id.key();
        self.write(ctx, move |s| match s.providers.remove(&key) {
            Some(provider) => {
                let ids: Vec<Uuid> = provider.versions().map(|v| v.id).collect();
                s.downloads.retain(|d| !ids.contains(&d.module_version_id));
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    async fn count_module_providers_in_namespace(
        &self,
        _ctx: &TxContext,
        namespace: &str,
    ) -> Result<i64> {
        self.read(|s| {
            s.providers
                .values()
                .filter(|p| names_match(&p.ident.namespace, namespace))
                .count() as i64
        })
    }
}

#[async_trait]
impl UserGroupRepository for MemoryStore {
    async fn find_user_group(&self, _ctx: &TxContext, name: &str) -> Result<Option<UserGroup>> {
        self.read(|s| s.user_groups.get(name).cloned())
    }

    async fn find_user_groups_by_names(
        &self,
        _ctx: &TxContext,
        names: &[String],
    ) -> Result<Vec<UserGroup>> {
        self.read(|s| {
            names
                .iter()
                .filter_map(|n| s.user_groups.get(n).cloned())
                .collect()
        })
    }

    async fn list_user_groups(&self, _ctx: &TxContext) -> Result<Vec<UserGroup>> {
        self.read(|s| s.user_groups.values().cloned().collect())
    }

    async fn save_user_group(&self, ctx: &TxContext, group: &UserGroup) -> Result<()> {
        let group = group.clone();
        self.write(ctx, move |s| {
            if let Some(existing) = s.user_groups.get(&group.name) {
                if existing.id != group.id {
                    return Err(AppError::AlreadyExists(format!(
                        "User group {} already exists",
                        group.name
                    )));
                }
            }
            s.user_groups.insert(group.name.clone(), group);
            Ok(())
        })
        .await
    }

    async fn delete_user_group(&self, ctx: &TxContext, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.write(ctx, move |s| Ok(s.user_groups.remove(&name).is_some()))
            .await
    }
}

#[async_trait]
impl AuthTokenRepository for MemoryStore {
    async fn find_token_by_hash(
        &self,
        _ctx: &TxContext,
        token_hash: &str,
    ) -> Result<Option<AuthenticationToken>> {
        self.read(|s| {
            s.tokens
                .values()
                .find(|t| t.token_hash == token_hash)
                .cloned()
        })
    }

    async fn find_token(&self, _ctx: &TxContext, id: Uuid) -> Result<Option<AuthenticationToken>> {
        self.read(|s| s.tokens.get(&id).cloned())
    }

    async fn list_tokens(
        &self,
        _ctx: &TxContext,
        filter: &AuthTokenFilter,
    ) -> Result<Vec<AuthenticationToken>> {
        self.read(|s| {
            let mut tokens: Vec<AuthenticationToken> = s
                .tokens
                .values()
                .filter(|t| filter.active.map(|a| a == t.active).unwrap_or(true))
                .filter(|t| match &filter.namespace {
                    Some(ns) => t
                        .namespace
                        .as_deref()
                        .map(|bound| names_match(bound, ns))
                        .unwrap_or(false),
                    None => true,
                })
                .cloned()
                .collect();
            tokens.sort_by_key(|t| t.created_at);
            tokens
        })
    }

    async fn save_token(&self, ctx: &TxContext, token: &AuthenticationToken) -> Result<()> {
        let token = token.clone();
        self.write(ctx, move |s| {
            s.tokens.insert(token.id, token);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn find_session(&self, _ctx: &TxContext, id: &str) -> Result<Option<Session>> {
        self.read(|s| s.sessions.get(id).cloned())
    }

    async fn save_session(&self, ctx: &TxContext, session: &Session) -> Result<()> {
        let session = session.clone();
        self.write(ctx, move |s| {
            s.sessions.insert(session.id.clone(), session);
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, ctx: &TxContext, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.write(ctx, move |s| Ok(s.sessions.remove(&id).is_some()))
            .await
    }

    async fn list_expired_sessions(
        &self,
        _ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.read(|s| {
            s.sessions
                .values()
                .filter(|session| session.is_expired(now))
                .map(|session| session.id.clone())
                .collect()
        })
    }
}

#[async_trait]
impl TerraformIdpRepository for MemoryStore {
    async fn save_authorization_code(&self, ctx: &TxContext, code: &AuthorizationCode) -> Result<()> {
        let code = code.clone();
        self.write(ctx, move |s| {
            s.authorization_codes.insert(code.code.clone(), code);
            Ok(())
        })
        .await
    }

    async fn find_authorization_code(
        &self,
        _ctx: &TxContext,
        code: &str,
    ) -> Result<Option<AuthorizationCode>> {
        self.read(|s| s.authorization_codes.get(code).cloned())
    }

    async fn mark_authorization_code_exchanged(
        &self,
        ctx: &TxContext,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let code = code.to_string();
        self.write(ctx, move |s| match s.authorization_codes.get_mut(&code) {
            Some(stored) if stored.exchanged_at.is_none() => {
                stored.exchanged_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn delete_authorization_code(&self, ctx: &TxContext, code: &str) -> Result<bool> {
        let code = code.to_string();
        self.write(ctx, move |s| Ok(s.authorization_codes.remove(&code).is_some()))
            .await
    }

    async fn list_expired_authorization_codes(
        &self,
        _ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.read(|s| {
            s.authorization_codes
                .values()
                .filter(|c| c.is_expired(now))
                .map(|c| c.code.clone())
                .collect()
        })
    }

    async fn save_access_token(&self, ctx: &TxContext, token: &AccessToken) -> Result<()> {
        let token = token.clone();
        self.write(ctx, move |s| {
            s.access_tokens.insert(token.jti.clone(), token);
            Ok(())
        })
        .await
    }

    async fn find_access_token(&self, _ctx: &TxContext, jti: &str) -> Result<Option<AccessToken>> {
        self.read(|s| s.access_tokens.get(jti).cloned())
    }

    async fn find_access_tokens_for_code(
        &self,
        _ctx: &TxContext,
        code: &str,
    ) -> Result<Vec<AccessToken>> {
        self.read(|s| {
            s.access_tokens
                .values()
                .filter(|t| t.authorization_code == code)
                .cloned()
                .collect()
        })
    }

    async fn delete_access_token(&self, ctx: &TxContext, jti: &str) -> Result<bool> {
        let jti = jti.to_string();
        self.write(ctx, move |s| Ok(s.access_tokens.remove(&jti).is_some()))
            .await
    }

    async fn list_expired_access_tokens(
        &self,
        _ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.read(|s| {
            s.access_tokens
                .values()
                .filter(|t| t.expires_at <= now)
                .map(|t| t.jti.clone())
                .collect()
        })
    }

    async fn find_subject_identifier(
        &self,
        _ctx: &TxContext,
        subject: &str,
        issuer: &str,
        auth_method: &str,
    ) -> Result<Option<SubjectIdentifier>> {
        self.read(|s| {
            s.subject_identifiers
                .values()
                .find(|si| si.subject == subject && si.issuer == issuer && si.auth_method == auth_method)
                .cloned()
        })
    }

    async fn find_subject_identifier_by_id(
        &self,
        _ctx: &TxContext,
        id: Uuid,
    ) -> Result<Option<SubjectIdentifier>> {
        self.read(|s| s.subject_identifiers.get(&id).cloned())
    }

    async fn save_subject_identifier(
        &self,
        ctx: &TxContext,
        subject: &SubjectIdentifier,
    ) -> Result<()> {
        let subject = subject.clone();
        self.write(ctx, move |s| {
            s.subject_identifiers.insert(subject.id, subject);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl GpgKeyRepository for MemoryStore {
    async fn find_gpg_key_by_key_id(&self, _ctx: &TxContext, key_id: &str) -> Result<Option<GpgKey>> {
        self.read(|s| {
            s.gpg_keys
                .values()
                .find(|k| k.key_id.eq_ignore_ascii_case(key_id))
                .cloned()
        })
    }

    async fn list_gpg_keys(&self, _ctx: &TxContext, namespace: &str) -> Result<Vec<GpgKey>> {
        self.read(|s| {
            let mut keys: Vec<GpgKey> = s
                .gpg_keys
                .values()
                .filter(|k| names_match(&k.namespace, namespace))
                .cloned()
                .collect();
            keys.sort_by_key(|k| k.created_at);
            keys
        })
    }

    async fn save_gpg_key(&self, ctx: &TxContext, key: &GpgKey) -> Result<()> {
        let key = key.clone();
        self.write(ctx, move |s| {
            if !s.namespaces.contains_key(&key.namespace.to_lowercase()) {
                return Err(AppError::NotFound(format!("Namespace {}", key.namespace)));
            }
            if s
                .gpg_keys
                .values()
                .any(|k| k.id != key.id && k.key_id == key.key_id)
            {
                return Err(AppError::AlreadyExists(format!(
                    "GPG key {} already exists",
                    key.key_id
                )));
            }
            s.gpg_keys.insert(key.id, key);
            Ok(())
        })
        .await
    }

    async fn delete_gpg_key(&self, ctx: &TxContext, id: Uuid) -> Result<bool> {
        self.write(ctx, move |s| Ok(s.gpg_keys.remove(&id).is_some()))
            .await
    }
}

#[async_trait]
impl AnalyticsRepository for MemoryStore {
    async fn record_download(&self, ctx: &TxContext, event: &DownloadEvent) -> Result<()> {
        let event = event.clone();
        self.write(ctx, move |s| {
            s.downloads.push(event);
            Ok(())
        })
        .await
    }

    async fn count_downloads(&self, _ctx: &TxContext, module_version_ids: &[Uuid]) -> Result<i64> {
        self.read(|s| {
            s.downloads
                .iter()
                .filter(|d| module_version_ids.contains(&d.module_version_id))
                .count() as i64
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transaction::with_transaction;
    use crate::models::module_provider::GitConfig;
    use crate::models::namespace::NamespaceType;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let ns = Namespace::new("acme", None, NamespaceType::Organisation).unwrap();
        store
            .save_namespace(&TxContext::background(), &ns)
            .await
            .unwrap();
        store
    }

    fn provider() -> ModuleProvider {
        ModuleProvider::new(
            ModuleProviderId::new("acme", "vpc", "aws").unwrap(),
            GitConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let store = seeded().await;
        let s = &store;
        let result: Result<()> = with_transaction(s, &TxContext::background(), "t", |tx| async move {
            s.save_module_provider(&tx, &provider()).await?;
            Err(AppError::Internal("abort".into()))
        })
        .await;
        assert!(result.is_err());
        let found = store
            .find_module_provider(
                &TxContext::background(),
                &ModuleProviderId::new("acme", "vpc", "aws").unwrap(),
            )
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_writes() {
        let store = seeded().await;
        let s = &store;
        with_transaction(s, &TxContext::background(), "outer", |tx| async move {
            s.save_module_provider(&tx, &provider()).await?;
            let _ = with_transaction(s, &tx, "inner", |inner| async move {
                let ns = Namespace::new("second", None, NamespaceType::User)?;
                s.save_namespace(&inner, &ns).await?;
                Err::<(), _>(AppError::Internal("inner failure".into()))
            })
            .await;
            Ok(())
        })
        .await
        .unwrap();

        let ctx = TxContext::background();
        assert!(store.find_namespace(&ctx, "second").await.unwrap().is_none());
        assert_eq!(
            store.count_module_providers_in_namespace(&ctx, "ACME").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_provider_identity_rejected() {
        let store = seeded().await;
        let ctx = TxContext::background();
        store.save_module_provider(&ctx, &provider()).await.unwrap();
        let err = store.save_module_provider(&ctx, &provider()).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_provider_requires_namespace() {
        let store = MemoryStore::new();
        let err = store
            .save_module_provider(&TxContext::background(), &provider())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_code_exchanged_once() {
        let store = MemoryStore::new();
        let ctx = TxContext::background();
        let now = Utc::now();
        let code = AuthorizationCode {
            code: "abc".into(),
            client_id: "terraform-cli".into(),
            redirect_uri: "http://localhost:10000/login".into(),
            scope: "openid".into(),
            state: "s".into(),
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            subject_identifier: None,
            expires_at: now + chrono::Duration::minutes(10),
            exchanged_at: None,
            created_at: now,
        };
        store.save_authorization_code(&ctx, &code).await.unwrap();
        assert!(store.mark_authorization_code_exchanged(&ctx, "abc", now).await.unwrap());
        assert!(!store.mark_authorization_code_exchanged(&ctx, "abc", now).await.unwrap());
        assert!(!store.mark_authorization_code_exchanged(&ctx, "missing", now).await.unwrap());
    }
}
