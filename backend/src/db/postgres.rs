//! PostgreSQL store.

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::repository::{
    AnalyticsRepository, AuthTokenFilter, AuthTokenRepository, GpgKeyRepository,
    ModuleProviderFilter, ModuleProviderRepository, NamespaceFilter, NamespaceRepository,
    SessionRepository, TerraformIdpRepository, UserGroupRepository,
};
use super::transaction::{
    with_transaction, HandleSlot, SqlDialect, TransactionBackend, TransactionHandle, TxContext,
};
use crate::error::{AppError, Result};
use crate::models::analytics::DownloadEvent;
use crate::models::auth_token::{AuthTokenType, AuthenticationToken};
use crate::models::gpg_key::GpgKey;
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_details::ModuleDetails;
use crate::models::module_provider::{GitConfig, ModuleProvider};
use crate::models::module_version::{
    ArchiveInfo, Example, ExampleFile, ModuleFile, ModuleVersion, Submodule, UrlOverrides,
};
use crate::models::namespace::Namespace;
use crate::models::permission::{NamespacePermissions, PermissionLevel};
use crate::models::session::Session;
use crate::models::terraform_idp::{
    AccessToken, AuthorizationCode, CodeChallengeMethod, SubjectIdentifier,
};
use crate::models::user_group::UserGroup;
use crate::models::version::Version;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The transaction's connection when `ctx` carries one, otherwise a
    /// pooled connection.
    async fn conn(&self, ctx: &TxContext) -> Result<Conn> {
        match ctx.lock_handle().await {
            Some(guard) => Ok(Conn::Tx(guard)),
            None => Ok(Conn::Pool(self.pool.acquire().await?)),
        }
    }
}

enum Conn {
    Pool(PoolConnection<Postgres>),
    Tx(OwnedMutexGuard<HandleSlot>),
}

impl Conn {
    fn get(&mut self) -> Result<&mut PgConnection> {
        match self {
            Conn::Pool(conn) => Ok(&mut **conn),
            Conn::Tx(guard) => {
                let slot: &mut HandleSlot = &mut **guard;
                let handle = slot
                    .as_mut()
                    .ok_or_else(|| AppError::Internal("Transaction already finished".into()))?;
                let pg = handle
                    .as_any_mut()
                    .downcast_mut::<PgTransactionHandle>()
                    .ok_or_else(|| {
                        AppError::Internal("Transaction belongs to another store".into())
                    })?;
                Ok(&mut *pg.tx)
            }
        }
    }

    fn in_transaction(&self) -> bool {
        matches!(self, Conn::Tx(_))
    }
}

struct PgTransactionHandle {
    tx: Transaction<'static, Postgres>,
}

impl PgTransactionHandle {
    async fn exec(&mut self, statement: &str, name: &str) -> Result<()> {
        let sql = format!("{} {}", statement, SqlDialect::Postgres.quote_identifier(name));
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionHandle for PgTransactionHandle {
    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.exec("SAVEPOINT", name).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec("RELEASE SAVEPOINT", name).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec("ROLLBACK TO SAVEPOINT", name).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl TransactionBackend for PgStore {
    async fn begin(&self) -> Result<Box<dyn TransactionHandle>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransactionHandle { tx }))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }
}

fn map_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::AlreadyExists(what()),
        _ => AppError::Database(err),
    }
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("Corrupt {} row: {}", what, err))
}

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct NamespaceRow {
    id: Uuid,
    name: String,
    display_name: Option<String>,
    namespace_type: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<NamespaceRow> for Namespace {
    type Error = AppError;

    fn try_from(row: NamespaceRow) -> Result<Self> {
        Ok(Namespace {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            namespace_type: row
                .namespace_type
                .parse()
                .map_err(|e| corrupt("namespace", e))?,
            created_at: row.created_at,
        })
    }
}

async fn namespace_id(conn: &mut PgConnection, name: &str) -> Result<Uuid> {
    sqlx::query_scalar("SELECT id FROM namespaces WHERE LOWER(name) = LOWER($1)")
        .bind(name)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Namespace {}", name)))
}

#[async_trait]
impl NamespaceRepository for PgStore {
    async fn find_namespace(&self, ctx: &TxContext, name: &str) -> Result<Option<Namespace>> {
        let mut conn = self.conn(ctx).await?;
        let row: Option<NamespaceRow> = sqlx::query_as(
            "SELECT id, name, display_name, namespace_type, created_at \
             FROM namespaces WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name)
        .fetch_optional(conn.get()?)
        .await?;
        row.map(Namespace::try_from).transpose()
    }

    async fn list_namespaces(
        &self,
        ctx: &TxContext,
        filter: &NamespaceFilter,
    ) -> Result<Vec<Namespace>> {
        let mut conn = self.conn(ctx).await?;
        let rows: Vec<NamespaceRow> = sqlx::query_as(
            "SELECT id, name, display_name, namespace_type, created_at FROM namespaces \
             WHERE ($1::text IS NULL OR namespace_type = $1) ORDER BY LOWER(name)",
        )
        .bind(filter.namespace_type.map(|t| t.as_str()))
        .fetch_all(conn.get()?)
        .await?;
        rows.into_iter().map(Namespace::try_from).collect()
    }

    async fn save_namespace(&self, ctx: &TxContext, namespace: &Namespace) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        sqlx::query(
            "INSERT INTO namespaces (id, name, display_name, namespace_type, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
             display_name = EXCLUDED.display_name, namespace_type = EXCLUDED.namespace_type",
        )
        .bind(namespace.id)
        .bind(&namespace.name)
        .bind(&namespace.display_name)
        .bind(namespace.namespace_type.as_str())
        .bind(namespace.created_at)
        .execute(conn.get()?)
        .await
        .map_err(|e| map_unique(e, || format!("Namespace {} already exists", namespace.name)))?;
        Ok(())
    }

    async fn delete_namespace(&self, ctx: &TxContext, name: &str) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query("DELETE FROM namespaces WHERE LOWER(name) = LOWER($1)")
            .bind(name)
            .execute(conn.get()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Module providers
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct ProviderRow {
    id: Uuid,
    namespace: String,
    module: String,
    provider: String,
    verified: bool,
    repo_base_url_template: Option<String>,
    repo_clone_url_template: Option<String>,
    repo_browse_url_template: Option<String>,
    git_tag_format: String,
    git_path: Option<String>,
    created_at: DateTime<Utc>,
}

const PROVIDER_COLUMNS: &str = "p.id, n.name AS namespace, p.module, p.provider, p.verified, \
     p.repo_base_url_template, p.repo_clone_url_template, p.repo_browse_url_template, \
     p.git_tag_format, p.git_path, p.created_at";

#[derive(FromRow)]
struct VersionRow {
    id: Uuid,
    module_provider_id: Uuid,
    version: String,
    internal: bool,
    published: bool,
    published_at: Option<DateTime<Utc>>,
    git_sha: Option<String>,
    git_tag: Option<String>,
    git_path: Option<String>,
    url_overrides: Json<UrlOverrides>,
    owner: Option<String>,
    description: Option<String>,
    variable_template: Option<serde_json::Value>,
    extraction_version: i32,
    details: Json<ModuleDetails>,
    archive: Json<ArchiveInfo>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ChildRow {
    id: Uuid,
    module_version_id: Uuid,
    path: String,
    details: Json<ModuleDetails>,
}

#[derive(FromRow)]
struct FileRow {
    owner_id: Uuid,
    path: String,
    content: String,
}

/// Loads the versions (with their children) of the given providers.
async fn load_versions(
    conn: &mut PgConnection,
    provider_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<ModuleVersion>>> {
    let rows: Vec<VersionRow> = sqlx::query_as(
        "SELECT id, module_provider_id, version, internal, published, published_at, git_sha, \
         git_tag, git_path, url_overrides, owner, description, variable_template, \
         extraction_version, details, archive, created_at \
         FROM module_versions WHERE module_provider_id = ANY($1)",
    )
    .bind(provider_ids)
    .fetch_all(&mut *conn)
    .await?;
    let version_ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

    let submodules: Vec<ChildRow> = sqlx::query_as(
        "SELECT id, module_version_id, path, details FROM submodules \
         WHERE module_version_id = ANY($1) ORDER BY path",
    )
    .bind(&version_ids)
    .fetch_all(&mut *conn)
    .await?;
    let examples: Vec<ChildRow> = sqlx::query_as(
        "SELECT id, module_version_id, path, details FROM examples \
         WHERE module_version_id = ANY($1) ORDER BY path",
    )
    .bind(&version_ids)
    .fetch_all(&mut *conn)
    .await?;
    let example_ids: Vec<Uuid> = examples.iter().map(|e| e.id).collect();
    let example_files: Vec<FileRow> = sqlx::query_as(
        "SELECT example_id AS owner_id, path, content FROM example_files \
         WHERE example_id = ANY($1) ORDER BY path",
    )
    .bind(&example_ids)
    .fetch_all(&mut *conn)
    .await?;
    let module_files: Vec<FileRow> = sqlx::query_as(
        "SELECT module_version_id AS owner_id, path, content FROM module_files \
         WHERE module_version_id = ANY($1) ORDER BY path",
    )
    .bind(&version_ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut files_by_example: HashMap<Uuid, Vec<ExampleFile>> = HashMap::new();
    for file in example_files {
        files_by_example
            .entry(file.owner_id)
            .or_default()
            .push(ExampleFile {
                path: file.path,
                content: file.content,
            });
    }
    let mut submodules_by_version: HashMap<Uuid, Vec<Submodule>> = HashMap::new();
    for row in submodules {
        submodules_by_version
            .entry(row.module_version_id)
            .or_default()
            .push(Submodule {
                path: row.path,
                details: row.details.0,
            });
    }
    let mut examples_by_version: HashMap<Uuid, Vec<Example>> = HashMap::new();
    for row in examples {
        let files = files_by_example.remove(&row.id).unwrap_or_default();
        examples_by_version
            .entry(row.module_version_id)
            .or_default()
            .push(Example {
                path: row.path,
                details: row.details.0,
                files,
            });
    }
    let mut module_files_by_version: HashMap<Uuid, Vec<ModuleFile>> = HashMap::new();
    for file in module_files {
        module_files_by_version
            .entry(file.owner_id)
            .or_default()
            .push(ModuleFile {
                path: file.path,
                content: file.content,
            });
    }

    let mut by_provider: HashMap<Uuid, Vec<ModuleVersion>> = HashMap::new();
    for row in rows {
        let version = Version::parse(&row.version).map_err(|e| corrupt("module version", e))?;
        let module_version = ModuleVersion {
            id: row.id,
            version,
            internal: row.internal,
            published: row.published,
            published_at: row.published_at,
            git_sha: row.git_sha,
            git_tag: row.git_tag,
            git_path: row.git_path,
            url_overrides: row.url_overrides.0,
            owner: row.owner,
            description: row.description,
            variable_template: row.variable_template,
            extraction_version: row.extraction_version,
            details: row.details.0,
            submodules: submodules_by_version.remove(&row.id).unwrap_or_default(),
            examples: examples_by_version.remove(&row.id).unwrap_or_default(),
            module_files: module_files_by_version.remove(&row.id).unwrap_or_default(),
            archive: row.archive.0,
            created_at: row.created_at,
        };
        by_provider
            .entry(row.module_provider_id)
            .or_default()
            .push(module_version);
    }
    Ok(by_provider)
}

fn assemble(row: ProviderRow, versions: Vec<ModuleVersion>) -> Result<ModuleProvider> {
    let ident = ModuleProviderId::new(&row.namespace, &row.module, &row.provider)
        .map_err(|e| corrupt("module provider", e))?;
    let git = GitConfig {
        repo_base_url_template: row.repo_base_url_template,
        repo_clone_url_template: row.repo_clone_url_template,
        repo_browse_url_template: row.repo_browse_url_template,
        git_tag_format: row.git_tag_format,
        git_path: row.git_path,
    };
    Ok(ModuleProvider::restore(
        row.id,
        ident,
        row.verified,
        git,
        versions,
        row.created_at,
    ))
}

async fn save_version(
    conn: &mut PgConnection,
    provider_id: Uuid,
    version: &ModuleVersion,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO module_versions (id, module_provider_id, version, internal, published, \
         published_at, git_sha, git_tag, git_path, url_overrides, owner, description, \
         variable_template, extraction_version, details, archive, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
         ON CONFLICT (id) DO UPDATE SET internal = EXCLUDED.internal, \
         published = EXCLUDED.published, published_at = EXCLUDED.published_at, \
         git_sha = EXCLUDED.git_sha, git_tag = EXCLUDED.git_tag, git_path = EXCLUDED.git_path, \
         url_overrides = EXCLUDED.url_overrides, owner = EXCLUDED.owner, \
         description = EXCLUDED.description, variable_template = EXCLUDED.variable_template, \
         extraction_version = EXCLUDED.extraction_version, details = EXCLUDED.details, \
         archive = EXCLUDED.archive",
    )
    .bind(version.id)
    .bind(provider_id)
    .bind(version.version.to_string())
    .bind(version.internal)
    .bind(version.published)
    .bind(version.published_at)
    .bind(&version.git_sha)
    .bind(&version.git_tag)
    .bind(&version.git_path)
    .bind(Json(&version.url_overrides))
    .bind(&version.owner)
    .bind(&version.description)
    .bind(&version.variable_template)
    .bind(version.extraction_version)
    .bind(Json(&version.details))
    .bind(Json(&version.archive))
    .bind(version.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_unique(e, || format!("Version {} already exists", version.version)))?;

    for table in ["submodules", "examples", "module_files"] {
        let sql = format!("DELETE FROM {} WHERE module_version_id = $1", table);
        sqlx::query(&sql).bind(version.id).execute(&mut *conn).await?;
    }

    for submodule in &version.submodules {
        sqlx::query(
            "INSERT INTO submodules (id, module_version_id, path, details) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(version.id)
        .bind(&submodule.path)
        .bind(Json(&submodule.details))
        .execute(&mut *conn)
        .await?;
    }
    for example in &version.examples {
        let example_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO examples (id, module_version_id, path, details) VALUES ($1, $2, $3, $4)",
        )
        .bind(example_id)
        .bind(version.id)
        .bind(&example.path)
        .bind(Json(&example.details))
        .execute(&mut *conn)
        .await?;
        for file in &example.files {
            sqlx::query(
                "INSERT INTO example_files (id, example_id, path, content) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(example_id)
            .bind(&file.path)
            .bind(&file.content)
            .execute(&mut *conn)
            .await?;
        }
    }
    for file in &version.module_files {
        sqlx::query(
            "INSERT INTO module_files (id, module_version_id, path, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(version.id)
        .bind(&file.path)
        .bind(&file.content)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl ModuleProviderRepository for PgStore {
    async fn find_module_provider(
        &self,
        ctx: &TxContext,
        id: &ModuleProviderId,
    ) -> Result<Option<ModuleProvider>> {
        let mut conn = self.conn(ctx).await?;
        let lock = if conn.in_transaction() {
            " FOR UPDATE OF p"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM module_providers p JOIN namespaces n ON n.id = p.namespace_id \
             WHERE LOWER(n.name) = LOWER($1) AND LOWER(p.module) = LOWER($2) \
             AND p.provider = $3{}",
            PROVIDER_COLUMNS, lock
        );
        let row: Option<ProviderRow> = sqlx::query_as(&sql)
            .bind(&id.namespace)
            .bind(&id.module)
            .bind(&id.provider)
            .fetch_optional(conn.get()?)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut versions = load_versions(conn.get()?, &[row.id]).await?;
        let own = versions.remove(&row.id).unwrap_or_default();
        assemble(row, own).map(Some)
    }

    async fn find_module_providers(
        &self,
        ctx: &TxContext,
        filter: &ModuleProviderFilter,
    ) -> Result<Vec<ModuleProvider>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!(
            "SELECT {} FROM module_providers p JOIN namespaces n ON n.id = p.namespace_id \
             WHERE ($1::text IS NULL OR LOWER(n.name) = LOWER($1)) \
             AND ($2::text IS NULL OR LOWER(p.module) = LOWER($2)) \
             AND ($3::text IS NULL OR p.provider = $3) \
             AND ($4::bool IS NULL OR p.verified = $4) \
             AND (NOT $5 OR EXISTS (SELECT 1 FROM module_versions v \
                  WHERE v.module_provider_id = p.id AND v.published)) \
             ORDER BY LOWER(n.name), LOWER(p.module), p.provider \
             LIMIT $6 OFFSET $7",
            PROVIDER_COLUMNS
        );
        let rows: Vec<ProviderRow> = sqlx::query_as(&sql)
            .bind(&filter.namespace)
            .bind(&filter.module)
            .bind(&filter.provider)
            .bind(filter.verified)
            .bind(filter.published_only)
            .bind(filter.limit)
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(conn.get()?)
            .await?;
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut versions = load_versions(conn.get()?, &ids).await?;
        rows.into_iter()
            .map(|row| {
                let own = versions.remove(&row.id).unwrap_or_default();
                assemble(row, own)
            })
            .collect()
    }

    async fn save_module_provider(&self, ctx: &TxContext, provider: &ModuleProvider) -> Result<()> {
        with_transaction(self, ctx, "save_module_provider", |tx| async move {
            let mut conn = self.conn(&tx).await?;
            let conn = conn.get()?;
            let ns_id = namespace_id(&mut *conn, &provider.ident.namespace).await?;
            sqlx::query(
                "INSERT INTO module_providers (id, namespace_id, module, provider, verified, \
                 repo_base_url_template, repo_clone_url_template, repo_browse_url_template, \
                 git_tag_format, git_path, latest_version, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (id) DO UPDATE SET verified = EXCLUDED.verified, \
                 repo_base_url_template = EXCLUDED.repo_base_url_template, \
                 repo_clone_url_template = EXCLUDED.repo_clone_url_template, \
                 repo_browse_url_template = EXCLUDED.repo_browse_url_template, \
                 git_tag_format = EXCLUDED.git_tag_format, git_path = EXCLUDED.git_path, \
                 latest_version = EXCLUDED.latest_version",
            )
            .bind(provider.id)
            .bind(ns_id)
            .bind(&provider.ident.module)
            .bind(&provider.ident.provider)
            .bind(provider.verified)
            .bind(&provider.git.repo_base_url_template)
            .bind(&provider.git.repo_clone_url_template)
            .bind(&provider.git.repo_browse_url_template)
            .bind(&provider.git.git_tag_format)
            .bind(&provider.git.git_path)
            .bind(provider.latest_version().map(|v| v.version.to_string()))
            .bind(provider.created_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                map_unique(e, || format!("Module provider {} already exists", provider.ident))
            })?;

            let kept: Vec<Uuid> = provider.versions().map(|v| v.id).collect();
            sqlx::query(
                "DELETE FROM module_versions WHERE module_provider_id = $1 AND NOT (id = ANY($2))",
            )
            .bind(provider.id)
            .bind(&kept)
            .execute(&mut *conn)
            .await?;

            for version in provider.versions() {
                save_version(&mut *conn, provider.id, version).await?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_module_provider(&self, ctx: &TxContext, id: &ModuleProviderId) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query(
            "DELETE FROM module_providers p USING namespaces n \
             WHERE n.id = p.namespace_id AND LOWER(n.name) = LOWER($1) \
             AND LOWER(p.module) = LOWER($2) AND p.provider = $3",
        )
        .bind(&id.namespace)
        .bind(&id.module)
        .bind(&id.provider)
        .execute(conn.get()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_module_providers_in_namespace(
        &self,
        ctx: &TxContext,
        namespace: &str,
    ) -> Result<i64> {
        let mut conn = self.conn(ctx).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM module_providers p JOIN namespaces n ON n.id = p.namespace_id \
             WHERE LOWER(n.name) = LOWER($1)",
        )
        .bind(namespace)
        .fetch_one(conn.get()?)
        .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// User groups
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct UserGroupRow {
    id: Uuid,
    name: String,
    site_admin: bool,
}

#[derive(FromRow)]
struct GroupPermissionRow {
    user_group_id: Uuid,
    namespace: String,
    permission_type: String,
}

async fn hydrate_groups(conn: &mut PgConnection, rows: Vec<UserGroupRow>) -> Result<Vec<UserGroup>> {
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let perms: Vec<GroupPermissionRow> = sqlx::query_as(
        "SELECT user_group_id, namespace, permission_type FROM user_group_namespace_permissions \
         WHERE user_group_id = ANY($1)",
    )
    .bind(&ids)
    .fetch_all(conn)
    .await?;

    let mut by_group: HashMap<Uuid, NamespacePermissions> = HashMap::new();
    for perm in perms {
        let level: PermissionLevel = perm
            .permission_type
            .parse()
            .map_err(|e| corrupt("user group permission", e))?;
        by_group
            .entry(perm.user_group_id)
            .or_default()
            .grant(&perm.namespace, level);
    }
    Ok(rows
        .into_iter()
        .map(|row| UserGroup {
            namespace_permissions: by_group.remove(&row.id).unwrap_or_default(),
            id: row.id,
            name: row.name,
            site_admin: row.site_admin,
        })
        .collect())
}

#[async_trait]
impl UserGroupRepository for PgStore {
    async fn find_user_group(&self, ctx: &TxContext, name: &str) -> Result<Option<UserGroup>> {
        let groups = self.find_user_groups_by_names(ctx, &[name.to_string()]).await?;
        Ok(groups.into_iter().next())
    }

    async fn find_user_groups_by_names(
        &self,
        ctx: &TxContext,
        names: &[String],
    ) -> Result<Vec<UserGroup>> {
        let mut conn = self.conn(ctx).await?;
        let conn = conn.get()?;
        let rows: Vec<UserGroupRow> =
            sqlx::query_as("SELECT id, name, site_admin FROM user_groups WHERE name = ANY($1)")
                .bind(names)
                .fetch_all(&mut *conn)
                .await?;
        hydrate_groups(conn, rows).await
    }

    async fn list_user_groups(&self, ctx: &TxContext) -> Result<Vec<UserGroup>> {
        let mut conn = self.conn(ctx).await?;
        let conn = conn.get()?;
        let rows: Vec<UserGroupRow> =
            sqlx::query_as("SELECT id, name, site_admin FROM user_groups ORDER BY name")
                .fetch_all(&mut *conn)
                .await?;
        hydrate_groups(conn, rows).await
    }

    async fn save_user_group(&self, ctx: &TxContext, group: &UserGroup) -> Result<()> {
        with_transaction(self, ctx, "save_user_group", |tx| async move {
            let mut conn = self.conn(&tx).await?;
            let conn = conn.get()?;
            sqlx::query(
                "INSERT INTO user_groups (id, name, site_admin) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
                 site_admin = EXCLUDED.site_admin",
            )
            .bind(group.id)
            .bind(&group.name)
            .bind(group.site_admin)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_unique(e, || format!("User group {} already exists", group.name)))?;

            sqlx::query("DELETE FROM user_group_namespace_permissions WHERE user_group_id = $1")
                .bind(group.id)
                .execute(&mut *conn)
                .await?;
            for (namespace, level) in group.namespace_permissions.iter() {
                sqlx::query(
                    "INSERT INTO user_group_namespace_permissions \
                     (user_group_id, namespace, permission_type) VALUES ($1, $2, $3)",
                )
                .bind(group.id)
                .bind(namespace)
                .bind(level.as_str())
                .execute(&mut *conn)
                .await?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_user_group(&self, ctx: &TxContext, name: &str) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query("DELETE FROM user_groups WHERE name = $1")
            .bind(name)
            .execute(conn.get()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Authentication tokens
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct TokenRow {
    id: Uuid,
    token_type: String,
    token_hash: String,
    description: String,
    namespace: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    active: bool,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TokenRow> for AuthenticationToken {
    type Error = AppError;

    fn try_from(row: TokenRow) -> Result<Self> {
        let token_type: AuthTokenType =
            row.token_type.parse().map_err(|e| corrupt("auth token", e))?;
        Ok(AuthenticationToken {
            id: row.id,
            token_type,
            token_hash: row.token_hash,
            description: row.description,
            namespace: row.namespace,
            expires_at: row.expires_at,
            active: row.active,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

const TOKEN_COLUMNS: &str =
    "id, token_type, token_hash, description, namespace, expires_at, active, created_by, created_at";

#[async_trait]
impl AuthTokenRepository for PgStore {
    async fn find_token_by_hash(
        &self,
        ctx: &TxContext,
        token_hash: &str,
    ) -> Result<Option<AuthenticationToken>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!("SELECT {} FROM auth_tokens WHERE token_hash = $1", TOKEN_COLUMNS);
        let row: Option<TokenRow> = sqlx::query_as(&sql)
            .bind(token_hash)
            .fetch_optional(conn.get()?)
            .await?;
        row.map(AuthenticationToken::try_from).transpose()
    }

    async fn find_token(&self, ctx: &TxContext, id: Uuid) -> Result<Option<AuthenticationToken>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!("SELECT {} FROM auth_tokens WHERE id = $1", TOKEN_COLUMNS);
        let row: Option<TokenRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(conn.get()?)
            .await?;
        row.map(AuthenticationToken::try_from).transpose()
    }

    async fn list_tokens(
        &self,
        ctx: &TxContext,
        filter: &AuthTokenFilter,
    ) -> Result<Vec<AuthenticationToken>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!(
            "SELECT {} FROM auth_tokens \
             WHERE ($1::text IS NULL OR LOWER(namespace) = LOWER($1)) \
             AND ($2::bool IS NULL OR active = $2) ORDER BY created_at",
            TOKEN_COLUMNS
        );
        let rows: Vec<TokenRow> = sqlx::query_as(&sql)
            .bind(&filter.namespace)
            .bind(filter.active)
            .fetch_all(conn.get()?)
            .await?;
        rows.into_iter().map(AuthenticationToken::try_from).collect()
    }

    async fn save_token(&self, ctx: &TxContext, token: &AuthenticationToken) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        sqlx::query(
            "INSERT INTO auth_tokens (id, token_type, token_hash, description, namespace, \
             expires_at, active, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET description = EXCLUDED.description, \
             expires_at = EXCLUDED.expires_at, active = EXCLUDED.active",
        )
        .bind(token.id)
        .bind(token.token_type.as_str())
        .bind(&token.token_hash)
        .bind(&token.description)
        .bind(&token.namespace)
        .bind(token.expires_at)
        .bind(token.active)
        .bind(&token.created_by)
        .bind(token.created_at)
        .execute(conn.get()?)
        .await
        .map_err(|e| map_unique(e, || "Token already exists".to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct SessionRow {
    id: String,
    expires_at: DateTime<Utc>,
    provider_source_auth: Vec<u8>,
    csrf_token: String,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            expires_at: row.expires_at,
            provider_source_auth: row.provider_source_auth,
            csrf_token: row.csrf_token,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn find_session(&self, ctx: &TxContext, id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn(ctx).await?;
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, expires_at, provider_source_auth, csrf_token, created_at \
             FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(conn.get()?)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn save_session(&self, ctx: &TxContext, session: &Session) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        sqlx::query(
            "INSERT INTO sessions (id, expires_at, provider_source_auth, csrf_token, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET expires_at = EXCLUDED.expires_at, \
             provider_source_auth = EXCLUDED.provider_source_auth, \
             csrf_token = EXCLUDED.csrf_token",
        )
        .bind(&session.id)
        .bind(session.expires_at)
        .bind(&session.provider_source_auth)
        .bind(&session.csrf_token)
        .bind(session.created_at)
        .execute(conn.get()?)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, ctx: &TxContext, id: &str) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(conn.get()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_sessions(
        &self,
        ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn(ctx).await?;
        let ids = sqlx::query_scalar("SELECT id FROM sessions WHERE expires_at < $1")
            .bind(now)
            .fetch_all(conn.get()?)
            .await?;
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Terraform identity provider
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct AuthorizationCodeRow {
    code: String,
    client_id: String,
    redirect_uri: String,
    scope: String,
    state: String,
    nonce: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    subject_identifier: Option<Uuid>,
    expires_at: DateTime<Utc>,
    exchanged_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuthorizationCodeRow> for AuthorizationCode {
    type Error = AppError;

    fn try_from(row: AuthorizationCodeRow) -> Result<Self> {
        let code_challenge_method = match row.code_challenge_method.as_deref() {
            Some(raw) => Some(
                CodeChallengeMethod::parse(raw)
                    .ok_or_else(|| corrupt("authorization code", raw))?,
            ),
            None => None,
        };
        Ok(AuthorizationCode {
            code: row.code,
            client_id: row.client_id,
            redirect_uri: row.redirect_uri,
            scope: row.scope,
            state: row.state,
            nonce: row.nonce,
            code_challenge: row.code_challenge,
            code_challenge_method,
            subject_identifier: row.subject_identifier,
            expires_at: row.expires_at,
            exchanged_at: row.exchanged_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct AccessTokenRow {
    jti: String,
    authorization_code: String,
    subject_identifier: Option<Uuid>,
    scope: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<AccessTokenRow> for AccessToken {
    fn from(row: AccessTokenRow) -> Self {
        AccessToken {
            jti: row.jti,
            authorization_code: row.authorization_code,
            subject_identifier: row.subject_identifier,
            scope: row.scope,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct SubjectIdentifierRow {
    id: Uuid,
    subject: String,
    issuer: String,
    auth_method: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<SubjectIdentifierRow> for SubjectIdentifier {
    fn from(row: SubjectIdentifierRow) -> Self {
        SubjectIdentifier {
            id: row.id,
            subject: row.subject,
            issuer: row.issuer,
            auth_method: row.auth_method,
            metadata: row.metadata,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

const CODE_COLUMNS: &str = "code, client_id, redirect_uri, scope, state, nonce, code_challenge, \
     code_challenge_method, subject_identifier, expires_at, exchanged_at, created_at";

#[async_trait]
impl TerraformIdpRepository for PgStore {
    async fn save_authorization_code(&self, ctx: &TxContext, code: &AuthorizationCode) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!(
            "INSERT INTO terraform_idp_authorization_codes ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            CODE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&code.code)
            .bind(&code.client_id)
            .bind(&code.redirect_uri)
            .bind(&code.scope)
            .bind(&code.state)
            .bind(&code.nonce)
            .bind(&code.code_challenge)
            .bind(code.code_challenge_method.map(|m| m.as_str()))
            .bind(code.subject_identifier)
            .bind(code.expires_at)
            .bind(code.exchanged_at)
            .bind(code.created_at)
            .execute(conn.get()?)
            .await
            .map_err(|e| map_unique(e, || "Authorization code collision".to_string()))?;
        Ok(())
    }

    async fn find_authorization_code(
        &self,
        ctx: &TxContext,
        code: &str,
    ) -> Result<Option<AuthorizationCode>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!(
            "SELECT {} FROM terraform_idp_authorization_codes WHERE code = $1",
            CODE_COLUMNS
        );
        let row: Option<AuthorizationCodeRow> = sqlx::query_as(&sql)
            .bind(code)
            .fetch_optional(conn.get()?)
            .await?;
        row.map(AuthorizationCode::try_from).transpose()
    }

    async fn mark_authorization_code_exchanged(
        &self,
        ctx: &TxContext,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query(
            "UPDATE terraform_idp_authorization_codes SET exchanged_at = $2 \
             WHERE code = $1 AND exchanged_at IS NULL",
        )
        .bind(code)
        .bind(now)
        .execute(conn.get()?)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_authorization_code(&self, ctx: &TxContext, code: &str) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query("DELETE FROM terraform_idp_authorization_codes WHERE code = $1")
            .bind(code)
            .execute(conn.get()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_authorization_codes(
        &self,
        ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn(ctx).await?;
        let codes = sqlx::query_scalar(
            "SELECT code FROM terraform_idp_authorization_codes WHERE expires_at <= $1",
        )
        .bind(now)
        .fetch_all(conn.get()?)
        .await?;
        Ok(codes)
    }

    async fn save_access_token(&self, ctx: &TxContext, token: &AccessToken) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        sqlx::query(
            "INSERT INTO terraform_idp_access_tokens \
             (jti, authorization_code, subject_identifier, scope, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&token.jti)
        .bind(&token.authorization_code)
        .bind(token.subject_identifier)
        .bind(&token.scope)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(conn.get()?)
        .await?;
        Ok(())
    }

    async fn find_access_token(&self, ctx: &TxContext, jti: &str) -> Result<Option<AccessToken>> {
        let mut conn = self.conn(ctx).await?;
        let row: Option<AccessTokenRow> = sqlx::query_as(
            "SELECT jti, authorization_code, subject_identifier, scope, expires_at, created_at \
             FROM terraform_idp_access_tokens WHERE jti = $1",
        )
        .bind(jti)
        .fetch_optional(conn.get()?)
        .await?;
        Ok(row.map(AccessToken::from))
    }

    async fn find_access_tokens_for_code(
        &self,
        ctx: &TxContext,
        code: &str,
    ) -> Result<Vec<AccessToken>> {
        let mut conn = self.conn(ctx).await?;
        let rows: Vec<AccessTokenRow> = sqlx::query_as(
            "SELECT jti, authorization_code, subject_identifier, scope, expires_at, created_at \
             FROM terraform_idp_access_tokens WHERE authorization_code = $1",
        )
        .bind(code)
        .fetch_all(conn.get()?)
        .await?;
        Ok(rows.into_iter().map(AccessToken::from).collect())
    }

    async fn delete_access_token(&self, ctx: &TxContext, jti: &str) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query("DELETE FROM terraform_idp_access_tokens WHERE jti = $1")
            .bind(jti)
            .execute(conn.get()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_access_tokens(
        &self,
        ctx: &TxContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn(ctx).await?;
        let ids =
            sqlx::query_scalar("SELECT jti FROM terraform_idp_access_tokens WHERE expires_at <= $1")
                .bind(now)
                .fetch_all(conn.get()?)
                .await?;
        Ok(ids)
    }

    async fn find_subject_identifier(
        &self,
        ctx: &TxContext,
        subject: &str,
        issuer: &str,
        auth_method: &str,
    ) -> Result<Option<SubjectIdentifier>> {
        let mut conn = self.conn(ctx).await?;
        let row: Option<SubjectIdentifierRow> = sqlx::query_as(
            "SELECT id, subject, issuer, auth_method, metadata, created_at, last_seen_at \
             FROM terraform_idp_subject_identifiers \
             WHERE subject = $1 AND issuer = $2 AND auth_method = $3",
        )
        .bind(subject)
        .bind(issuer)
        .bind(auth_method)
        .fetch_optional(conn.get()?)
        .await?;
        Ok(row.map(SubjectIdentifier::from))
    }

    async fn find_subject_identifier_by_id(
        &self,
        ctx: &TxContext,
        id: Uuid,
    ) -> Result<Option<SubjectIdentifier>> {
        let mut conn = self.conn(ctx).await?;
        let row: Option<SubjectIdentifierRow> = sqlx::query_as(
            "SELECT id, subject, issuer, auth_method, metadata, created_at, last_seen_at \
             FROM terraform_idp_subject_identifiers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(conn.get()?)
        .await?;
        Ok(row.map(SubjectIdentifier::from))
    }

    async fn save_subject_identifier(
        &self,
        ctx: &TxContext,
        subject: &SubjectIdentifier,
    ) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        sqlx::query(
            "INSERT INTO terraform_idp_subject_identifiers \
             (id, subject, issuer, auth_method, metadata, created_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET metadata = EXCLUDED.metadata, \
             last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(subject.id)
        .bind(&subject.subject)
        .bind(&subject.issuer)
        .bind(&subject.auth_method)
        .bind(&subject.metadata)
        .bind(subject.created_at)
        .bind(subject.last_seen_at)
        .execute(conn.get()?)
        .await
        .map_err(|e| map_unique(e, || format!("Subject {} already registered", subject.subject)))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GPG keys
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct GpgKeyRow {
    id: Uuid,
    namespace: String,
    key_id: String,
    ascii_armor: String,
    fingerprint: Option<String>,
    source: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<GpgKeyRow> for GpgKey {
    fn from(row: GpgKeyRow) -> Self {
        GpgKey {
            id: row.id,
            namespace: row.namespace,
            key_id: row.key_id,
            ascii_armor: row.ascii_armor,
            fingerprint: row.fingerprint,
            source: row.source,
            created_at: row.created_at,
        }
    }
}

const GPG_COLUMNS: &str = "g.id, n.name AS namespace, g.key_id, g.ascii_armor, g.fingerprint, \
     g.source, g.created_at";

#[async_trait]
impl GpgKeyRepository for PgStore {
    async fn find_gpg_key_by_key_id(&self, ctx: &TxContext, key_id: &str) -> Result<Option<GpgKey>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!(
            "SELECT {} FROM gpg_keys g JOIN namespaces n ON n.id = g.namespace_id \
             WHERE UPPER(g.key_id) = UPPER($1)",
            GPG_COLUMNS
        );
        let row: Option<GpgKeyRow> = sqlx::query_as(&sql)
            .bind(key_id)
            .fetch_optional(conn.get()?)
            .await?;
        Ok(row.map(GpgKey::from))
    }

    async fn list_gpg_keys(&self, ctx: &TxContext, namespace: &str) -> Result<Vec<GpgKey>> {
        let mut conn = self.conn(ctx).await?;
        let sql = format!(
            "SELECT {} FROM gpg_keys g JOIN namespaces n ON n.id = g.namespace_id \
             WHERE LOWER(n.name) = LOWER($1) ORDER BY g.created_at",
            GPG_COLUMNS
        );
        let rows: Vec<GpgKeyRow> = sqlx::query_as(&sql)
            .bind(namespace)
            .fetch_all(conn.get()?)
            .await?;
        Ok(rows.into_iter().map(GpgKey::from).collect())
    }

    async fn save_gpg_key(&self, ctx: &TxContext, key: &GpgKey) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        let conn = conn.get()?;
        let ns_id = namespace_id(&mut *conn, &key.namespace).await?;
        sqlx::query(
            "INSERT INTO gpg_keys (id, namespace_id, key_id, ascii_armor, fingerprint, source, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET ascii_armor = EXCLUDED.ascii_armor, \
             fingerprint = EXCLUDED.fingerprint, source = EXCLUDED.source",
        )
        .bind(key.id)
        .bind(ns_id)
        .bind(&key.key_id)
        .bind(&key.ascii_armor)
        .bind(&key.fingerprint)
        .bind(&key.source)
        .bind(key.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, || format!("GPG key {} already exists", key.key_id)))?;
        Ok(())
    }

    async fn delete_gpg_key(&self, ctx: &TxContext, id: Uuid) -> Result<bool> {
        let mut conn = self.conn(ctx).await?;
        let result = sqlx::query("DELETE FROM gpg_keys WHERE id = $1")
            .bind(id)
            .execute(conn.get()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

#[async_trait]
impl AnalyticsRepository for PgStore {
    async fn record_download(&self, ctx: &TxContext, event: &DownloadEvent) -> Result<()> {
        let mut conn = self.conn(ctx).await?;
        sqlx::query(
            "INSERT INTO module_downloads (id, module_version_id, timestamp, terraform_version, \
             analytics_token, auth_method, environment) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(event.module_version_id)
        .bind(event.timestamp)
        .bind(&event.terraform_version)
        .bind(&event.analytics_token)
        .bind(&event.auth_method)
        .bind(&event.environment)
        .execute(conn.get()?)
        .await?;
        Ok(())
    }

    async fn count_downloads(&self, ctx: &TxContext, module_version_ids: &[Uuid]) -> Result<i64> {
        let mut conn = self.conn(ctx).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM module_downloads WHERE module_version_id = ANY($1)",
        )
        .bind(module_version_ids)
        .fetch_one(conn.get()?)
        .await?;
        Ok(count)
    }
}
