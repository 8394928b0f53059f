//! Terraform Registry Protocol API handlers.
//!
//! Service Discovery:
//!   GET  /.well-known/terraform.json
//!
//! Module Registry (mounted at `/v1/modules`):
//!   GET  /{namespace}/{name}/{provider}/versions
//!   GET  /{namespace}/{name}/{provider}/download
//!   GET  /{namespace}/{name}/{provider}/{version}/download
//!   GET  /{namespace}/{name}/{provider}/{version}
//!   GET  /{namespace}/{name}/{provider}

use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::require_terraform_access;
use crate::api::SharedState;
use crate::db::repository::AnalyticsRepository;
use crate::db::TxContext;
use crate::error::{AppError, Result};
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_details::ModuleDetails;
use crate::models::module_provider::ModuleProvider;
use crate::models::module_version::ModuleVersion;
use crate::models::version::Version;
use crate::services::auth_context::AuthContext;

static TERRAFORM_GET: HeaderName = HeaderName::from_static("x-terraform-get");
static TERRAFORM_VERSION: HeaderName = HeaderName::from_static("x-terraform-version");

pub const MODULES_V1_PATH: &str = "/v1/modules/";

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/:namespace/:name/:provider", get(latest_module_version))
        .route("/:namespace/:name/:provider/versions", get(list_module_versions))
        .route("/:namespace/:name/:provider/download", get(download_latest))
        .route("/:namespace/:name/:provider/:version", get(module_version))
        .route("/:namespace/:name/:provider/:version/download", get(download_module))
}

// ---------------------------------------------------------------------------
// GET /.well-known/terraform.json
// ---------------------------------------------------------------------------

pub async fn service_discovery(State(state): State<SharedState>) -> Json<Value> {
    let mut body = json!({ "modules.v1": MODULES_V1_PATH });
    if let Some(login) = state.idp.login_service() {
        body["login.v1"] = login;
    }
    Json(body)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load_provider(
    state: &SharedState,
    ctx: &TxContext,
    namespace: &str,
    name: &str,
    provider: &str,
) -> Result<ModuleProvider> {
    let ident = ModuleProviderId::new(namespace, name, provider)?;
    state.modules.get_module_provider(ctx, &ident).await
}

fn published_version<'a>(provider: &'a ModuleProvider, raw: &str) -> Result<&'a ModuleVersion> {
    let version = Version::parse(raw)?;
    provider
        .get_version(&version)
        .filter(|v| v.published)
        .ok_or_else(|| {
            AppError::NotFound(format!("Version {} of {} not found", version, provider.ident))
        })
}

fn latest(provider: &ModuleProvider) -> Result<&ModuleVersion> {
    provider.latest_version().ok_or_else(|| {
        AppError::NotFound(format!("{} has no published versions", provider.ident))
    })
}

fn spec_json(path: &str, details: &ModuleDetails) -> Value {
    let docs = details.docs();
    let inputs: Vec<Value> = docs
        .inputs
        .iter()
        .map(|i| {
            json!({
                "name": i.name,
                "type": i.type_,
                "description": i.description,
                "default": i.default,
                "required": i.required,
            })
        })
        .collect();
    let outputs: Vec<Value> = docs
        .outputs
        .iter()
        .map(|o| json!({ "name": o.name, "description": o.description }))
        .collect();
    let dependencies: Vec<Value> = docs
        .modules
        .iter()
        .map(|m| json!({ "name": m.name, "source": m.source, "version": m.version }))
        .collect();
    let provider_dependencies: Vec<Value> = docs
        .providers
        .iter()
        .map(|p| json!({ "name": p.name, "alias": p.alias, "version": p.version }))
        .collect();
    let resources: Vec<Value> = docs
        .resources
        .iter()
        .map(|r| json!({ "name": r.name, "type": r.type_ }))
        .collect();

    json!({
        "path": path,
        "readme": details.readme_content.clone().unwrap_or_default(),
        "empty": inputs.is_empty() && outputs.is_empty() && resources.is_empty(),
        "inputs": inputs,
        "outputs": outputs,
        "dependencies": dependencies,
        "provider_dependencies": provider_dependencies,
        "resources": resources,
    })
}

/// Registry metadata document of one version.
pub fn module_json(provider: &ModuleProvider, version: &ModuleVersion, downloads: i64) -> Value {
    let ident = &provider.ident;
    let submodules: Vec<Value> = version
        .submodules
        .iter()
        .map(|s| spec_json(&s.path, &s.details))
        .collect();
    let examples: Vec<Value> = version
        .examples
        .iter()
        .map(|e| spec_json(&e.path, &e.details))
        .collect();
    let versions: Vec<String> = provider
        .published_versions()
        .map(|v| v.version.to_string())
        .collect();

    json!({
        "id": format!("{}/{}", ident.key(), version.version),
        "owner": version.owner,
        "namespace": ident.namespace,
        "name": ident.module,
        "provider": ident.provider,
        "version": version.version.to_string(),
        "description": version.description,
        "source": provider.base_url(Some(version)),
        "published_at": version.published_at,
        "downloads": downloads,
        "verified": provider.verified,
        "root": spec_json("", &version.details),
        "submodules": submodules,
        "examples": examples,
        "providers": [ident.provider],
        "versions": versions,
    })
}

async fn module_response(
    state: &SharedState,
    ctx: &TxContext,
    provider: &ModuleProvider,
    version: &ModuleVersion,
) -> Result<Json<Value>> {
    let downloads = state.store.count_downloads(ctx, &[version.id]).await?;
    Ok(Json(module_json(provider, version, downloads)))
}

async fn download_response(
    state: &SharedState,
    auth: &AuthContext,
    ctx: &TxContext,
    headers: &HeaderMap,
    provider: &ModuleProvider,
    version: &ModuleVersion,
) -> Result<Response> {
    let location = state.modules.download_location(provider, version)?;
    let terraform_version = headers
        .get(&TERRAFORM_VERSION)
        .and_then(|h| h.to_str().ok());
    if let Err(e) = state
        .analytics
        .record_download(auth, ctx, provider, version, terraform_version)
        .await
    {
        tracing::warn!(
            module = %provider.ident,
            version = %version.version,
            "Failed to record download: {}",
            e
        );
    }

    let value = HeaderValue::from_str(&location)
        .map_err(|e| AppError::Internal(format!("Invalid download location: {}", e)))?;
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().insert(TERRAFORM_GET.clone(), value);
    Ok(response)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_module_versions(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path((namespace, name, provider)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    require_terraform_access(&state, &auth)?;
    let provider = load_provider(&state, &ctx, &namespace, &name, &provider).await?;
    let versions: Vec<Value> = provider
        .published_versions()
        .map(|v| json!({ "version": v.version.to_string() }))
        .collect();
    Ok(Json(json!({ "modules": [{ "versions": versions }] })))
}

async fn download_module(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    headers: HeaderMap,
    Path((namespace, name, provider, version)): Path<(String, String, String, String)>,
) -> Result<Response> {
    require_terraform_access(&state, &auth)?;
    let provider = load_provider(&state, &ctx, &namespace, &name, &provider).await?;
    let version = published_version(&provider, &version)?;
    download_response(&state, &auth, &ctx, &headers, &provider, version).await
}

async fn download_latest(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    headers: HeaderMap,
    Path((namespace, name, provider)): Path<(String, String, String)>,
) -> Result<Response> {
    require_terraform_access(&state, &auth)?;
    let provider = load_provider(&state, &ctx, &namespace, &name, &provider).await?;
    let version = latest(&provider)?;
    download_response(&state, &auth, &ctx, &headers, &provider, version).await
}

async fn module_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path((namespace, name, provider, version)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    require_terraform_access(&state, &auth)?;
    let provider = load_provider(&state, &ctx, &namespace, &name, &provider).await?;
    let version = published_version(&provider, &version)?;
    module_response(&state, &ctx, &provider, version).await
}

async fn latest_module_version(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path((namespace, name, provider)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    require_terraform_access(&state, &auth)?;
    let provider = load_provider(&state, &ctx, &namespace, &name, &provider).await?;
    let version = latest(&provider)?;
    module_response(&state, &ctx, &provider, version).await
}
