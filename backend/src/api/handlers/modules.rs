//! Module provider administration, ingestion and archive handlers.
//!
//! Mounted at `/v1/terrareg/modules`.

use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::require_read_access;
use crate::api::SharedState;
use crate::db::repository::ModuleProviderFilter;
use crate::db::TxContext;
use crate::error::{AppError, Result};
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_provider::{GitConfig, ModuleProvider};
use crate::models::module_version::ModuleVersion;
use crate::models::version::Version;
use crate::services::auth_context::AuthContext;
use crate::services::ingestion_service::{IngestOutcome, IngestRequest, IngestSource};
use crate::services::module_service::archive_path;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_providers))
        .route(
            "/:namespace/:name/:provider",
            get(get_provider).post(create_provider).delete(delete_provider),
        )
        .route("/:namespace/:name/:provider/settings", put(update_settings))
        .route(
            "/:namespace/:name/:provider/verify",
            post(verify_provider).delete(unverify_provider),
        )
        .route("/:namespace/:name/:provider/import", post(import_version))
        .route("/:namespace/:name/:provider/analytics", get(provider_analytics))
        .route(
            "/:namespace/:name/:provider/:version",
            get(get_version).delete(delete_version),
        )
        .route(
            "/:namespace/:name/:provider/:version/upload",
            post(upload_version).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/:namespace/:name/:provider/:version/publish", post(publish_version))
        .route("/:namespace/:name/:provider/:version/:file", get(download_archive))
}

type ProviderPath = Path<(String, String, String)>;
type VersionPath = Path<(String, String, String, String)>;

fn ident((namespace, name, provider): &(String, String, String)) -> Result<ModuleProviderId> {
    ModuleProviderId::new(namespace, name, provider)
}

fn version_ident(
    (namespace, name, provider, version): &(String, String, String, String),
) -> Result<(ModuleProviderId, Version)> {
    Ok((
        ModuleProviderId::new(namespace, name, provider)?,
        Version::parse(version)?,
    ))
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct VersionSummary {
    pub version: String,
    pub published: bool,
    pub published_at: Option<chrono::DateTime<chrono::Utc>>,
    pub beta: bool,
    pub git_sha: Option<String>,
    pub git_tag: Option<String>,
}

impl From<&ModuleVersion> for VersionSummary {
    fn from(v: &ModuleVersion) -> Self {
        Self {
            version: v.version.to_string(),
            published: v.published,
            published_at: v.published_at,
            beta: v.beta(),
            git_sha: v.git_sha.clone(),
            git_tag: v.git_tag.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProviderResponse {
    pub id: String,
    pub namespace: String,
    pub module: String,
    pub provider: String,
    pub verified: bool,
    pub git: GitConfig,
    pub latest_version: Option<String>,
    pub versions: Vec<VersionSummary>,
}

impl From<&ModuleProvider> for ProviderResponse {
    fn from(p: &ModuleProvider) -> Self {
        Self {
            id: p.ident.key(),
            namespace: p.ident.namespace.clone(),
            module: p.ident.module.clone(),
            provider: p.ident.provider.clone(),
            verified: p.verified,
            git: p.git.clone(),
            latest_version: p.latest_version().map(|v| v.version.to_string()),
            versions: p.versions().rev().map(VersionSummary::from).collect(),
        }
    }
}

fn ingest_json(outcome: &IngestOutcome) -> Value {
    json!({
        "id": format!("{}/{}", outcome.ident.key(), outcome.version),
        "version": outcome.version.to_string(),
        "git_sha": outcome.git_sha,
        "git_tag": outcome.git_tag,
        "published": outcome.published,
        "latest_version": outcome.latest_version.as_ref().map(|v| v.to_string()),
        "archive": {
            "formats": outcome.archive.keys.iter().map(|(ext, _)| ext.as_str()).collect::<Vec<_>>(),
            "total_bytes": outcome.archive.total_bytes,
            "source_file_count": outcome.archive.source_file_count,
            "skipped_reason": outcome.archive.skipped_reason,
        },
        "warnings": outcome.warnings,
    })
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListProvidersQuery {
    pub namespace: Option<String>,
    pub module: Option<String>,
    pub provider: Option<String>,
    pub verified: Option<bool>,
    #[serde(default)]
    pub published_only: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

async fn list_providers(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Query(query): Query<ListProvidersQuery>,
) -> Result<Json<Vec<ProviderResponse>>> {
    require_read_access(&state, &auth)?;
    let filter = ModuleProviderFilter {
        namespace: query.namespace,
        module: query.module,
        provider: query.provider,
        verified: query.verified,
        published_only: query.published_only,
        limit: query.limit,
        offset: query.offset,
    };
    let providers = state.modules.list_module_providers(&ctx, &filter).await?;
    Ok(Json(providers.iter().map(ProviderResponse::from).collect()))
}

async fn get_provider(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
) -> Result<Json<ProviderResponse>> {
    require_read_access(&state, &auth)?;
    let provider = state.modules.get_module_provider(&ctx, &ident(&path)?).await?;
    Ok(Json(ProviderResponse::from(&provider)))
}

#[derive(Debug, Default, Deserialize)]
pub struct GitConfigRequest {
    pub repo_base_url_template: Option<String>,
    pub repo_clone_url_template: Option<String>,
    pub repo_browse_url_template: Option<String>,
    pub git_tag_format: Option<String>,
    pub git_path: Option<String>,
}

impl From<GitConfigRequest> for GitConfig {
    fn from(req: GitConfigRequest) -> Self {
        let defaults = GitConfig::default();
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            repo_base_url_template: non_empty(req.repo_base_url_template),
            repo_clone_url_template: non_empty(req.repo_clone_url_template),
            repo_browse_url_template: non_empty(req.repo_browse_url_template),
            git_tag_format: non_empty(req.git_tag_format).unwrap_or(defaults.git_tag_format),
            git_path: non_empty(req.git_path),
        }
    }
}

async fn create_provider(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
    Json(body): Json<GitConfigRequest>,
) -> Result<(StatusCode, Json<ProviderResponse>)> {
    let provider = state
        .modules
        .create_module_provider(&auth, &ctx, ident(&path)?, body.into())
        .await?;
    Ok((StatusCode::CREATED, Json(ProviderResponse::from(&provider))))
}

async fn update_settings(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
    Json(body): Json<GitConfigRequest>,
) -> Result<Json<ProviderResponse>> {
    let provider = state
        .modules
        .update_git_config(&auth, &ctx, &ident(&path)?, body.into())
        .await?;
    Ok(Json(ProviderResponse::from(&provider)))
}

async fn delete_provider(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
) -> Result<StatusCode> {
    state
        .modules
        .delete_module_provider(&auth, &ctx, &ident(&path)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn verify_provider(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
) -> Result<Json<ProviderResponse>> {
    let provider = state
        .modules
        .set_verified(&auth, &ctx, &ident(&path)?, true)
        .await?;
    Ok(Json(ProviderResponse::from(&provider)))
}

async fn unverify_provider(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
) -> Result<Json<ProviderResponse>> {
    let provider = state
        .modules
        .set_verified(&auth, &ctx, &ident(&path)?, false)
        .await?;
    Ok(Json(ProviderResponse::from(&provider)))
}

async fn provider_analytics(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
) -> Result<Json<Value>> {
    require_read_access(&state, &auth)?;
    let provider = state.modules.get_module_provider(&ctx, &ident(&path)?).await?;
    let summary = state.analytics.download_summary(&ctx, &provider).await?;
    let per_version: serde_json::Map<String, Value> = summary
        .per_version
        .into_iter()
        .map(|(version, count)| (version, json!(count)))
        .collect();
    Ok(Json(json!({
        "id": provider.ident.key(),
        "total_downloads": summary.total,
        "versions": per_version,
    })))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ImportRequest {
    pub version: Option<String>,
    pub git_tag: Option<String>,
    #[serde(default)]
    pub publish: bool,
}

async fn import_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): ProviderPath,
    Json(body): Json<ImportRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let version = body
        .version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Version::parse)
        .transpose()?;
    let git_tag = body
        .git_tag
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let request = IngestRequest {
        ident: ident(&path)?,
        source: IngestSource::Git { version, git_tag },
        publish: body.publish,
    };
    let outcome = state
        .ingestion
        .ingest(&auth, request, ctx.cancellation().clone())
        .await?;
    Ok((StatusCode::CREATED, Json(ingest_json(&outcome))))
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub publish: bool,
}

async fn upload_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): VersionPath,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>)> {
    let (ident, version) = version_ident(&path)?;

    let mut content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::Validation(format!("Failed to read upload: {}", e)))?;
            content = Some(bytes);
            break;
        }
    }
    let content = content
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::Validation("Missing 'file' field".into()))?;

    let request = IngestRequest {
        ident,
        source: IngestSource::Upload { version, content },
        publish: query.publish,
    };
    let outcome = state
        .ingestion
        .ingest(&auth, request, ctx.cancellation().clone())
        .await?;
    Ok((StatusCode::CREATED, Json(ingest_json(&outcome))))
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

async fn get_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): VersionPath,
) -> Result<Json<Value>> {
    require_read_access(&state, &auth)?;
    let (ident, version) = version_ident(&path)?;
    let provider = state.modules.get_module_provider(&ctx, &ident).await?;
    let found = provider
        .get_version(&version)
        .ok_or_else(|| AppError::NotFound(format!("Version {} of {} not found", version, ident)))?;
    let mut body = serde_json::to_value(found)?;
    body["usage_example"] = json!(provider.usage_example(state.config.public_host(), found));
    body["is_latest"] = json!(provider.latest_version().map(|v| v.id) == Some(found.id));
    Ok(Json(body))
}

async fn publish_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): VersionPath,
) -> Result<Json<ProviderResponse>> {
    let (ident, version) = version_ident(&path)?;
    let provider = state
        .modules
        .publish_version(&auth, &ctx, &ident, &version)
        .await?;
    Ok(Json(ProviderResponse::from(&provider)))
}

async fn delete_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(path): VersionPath,
) -> Result<Json<ProviderResponse>> {
    let (ident, version) = version_ident(&path)?;
    let provider = state
        .modules
        .delete_version(&auth, &ctx, &ident, &version)
        .await?;
    Ok(Json(ProviderResponse::from(&provider)))
}

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

fn archive_extension(file: &str) -> Option<(&'static str, &'static str)> {
    match file {
        "source.zip" => Some(("zip", "application/zip")),
        "source.tar.gz" => Some(("tar.gz", "application/gzip")),
        _ => None,
    }
}

/// Serve an archive behind a signed URL issued by the download endpoint.
async fn download_archive(
    State(state): State<SharedState>,
    Extension(ctx): Extension<TxContext>,
    Path((namespace, name, provider, version, file)): Path<(String, String, String, String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response> {
    let (extension, content_type) = archive_extension(&file)
        .ok_or_else(|| AppError::NotFound(format!("Unknown archive {}", file)))?;
    let (ident, version) = version_ident(&(namespace, name, provider, version))?;
    let path = archive_path(&ident, &version, extension);
    state
        .modules
        .verify_download(&path, query.expires, &query.signature)?;

    let bytes = state
        .modules
        .read_archive(&ctx, &ident, &version, extension)
        .await?;
    Ok(([(CONTENT_TYPE, content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_config_request_defaults() {
        let git: GitConfig = GitConfigRequest {
            repo_clone_url_template: Some("  ".into()),
            git_tag_format: None,
            git_path: Some(" modules/vpc ".into()),
            ..GitConfigRequest::default()
        }
        .into();
        assert_eq!(git.repo_clone_url_template, None);
        assert_eq!(git.git_tag_format, "{version}");
        assert_eq!(git.git_path.as_deref(), Some("modules/vpc"));
    }

    #[test]
    fn test_archive_extension() {
        assert_eq!(archive_extension("source.zip"), Some(("zip", "application/zip")));
        assert_eq!(
            archive_extension("source.tar.gz"),
            Some(("tar.gz", "application/gzip"))
        );
        assert_eq!(archive_extension("../../etc/passwd"), None);
    }

    #[test]
    fn test_provider_response_lists_newest_first() {
        let mut provider = ModuleProvider::new(
            ModuleProviderId::new("acme", "vpc", "aws").unwrap(),
            GitConfig::default(),
        );
        for v in ["1.0.0", "2.0.0-beta", "1.1.0"] {
            provider
                .add_version(ModuleVersion::new(Version::parse(v).unwrap()))
                .unwrap();
        }
        let response = ProviderResponse::from(&provider);
        let versions: Vec<&str> = response.versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(versions, vec!["2.0.0-beta", "1.1.0", "1.0.0"]);
        assert!(response.versions[0].beta);
        assert_eq!(response.latest_version, None);
    }
}
