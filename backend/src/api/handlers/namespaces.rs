//! Namespace and GPG key handlers.
//!
//! Mounted at `/v1/terrareg/namespaces` and `/v1/terrareg/gpg-keys`.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::require_read_access;
use crate::api::SharedState;
use crate::db::repository::NamespaceFilter;
use crate::db::TxContext;
use crate::error::Result;
use crate::models::gpg_key::GpgKey;
use crate::models::namespace::{Namespace, NamespaceType};
use crate::services::auth_context::AuthContext;
use crate::services::module_service::{AddGpgKeyRequest, CreateNamespaceRequest};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_namespaces).post(create_namespace))
        .route("/:namespace", get(get_namespace).delete(delete_namespace))
        .route("/:namespace/gpg-keys", get(list_gpg_keys).post(add_gpg_key))
        .route(
            "/:namespace/gpg-keys/:key_id",
            axum::routing::delete(delete_gpg_key),
        )
}

/// Lookup of a key by id, regardless of namespace.
pub fn gpg_router() -> Router<SharedState> {
    Router::new().route("/:key_id", get(get_gpg_key))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListNamespacesQuery {
    #[serde(rename = "type")]
    pub namespace_type: Option<NamespaceType>,
}

async fn list_namespaces(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Query(query): Query<ListNamespacesQuery>,
) -> Result<Json<Vec<Namespace>>> {
    require_read_access(&state, &auth)?;
    let filter = NamespaceFilter {
        namespace_type: query.namespace_type,
    };
    Ok(Json(state.modules.list_namespaces(&ctx, &filter).await?))
}

async fn create_namespace(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Json(body): Json<CreateNamespaceRequest>,
) -> Result<(StatusCode, Json<Namespace>)> {
    let namespace = state.modules.create_namespace(&auth, &ctx, body).await?;
    Ok((StatusCode::CREATED, Json(namespace)))
}

async fn get_namespace(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(namespace): Path<String>,
) -> Result<Json<Namespace>> {
    require_read_access(&state, &auth)?;
    Ok(Json(state.modules.get_namespace(&ctx, &namespace).await?))
}

async fn delete_namespace(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(namespace): Path<String>,
) -> Result<StatusCode> {
    state.modules.delete_namespace(&auth, &ctx, &namespace).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_gpg_keys(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(namespace): Path<String>,
) -> Result<Json<Vec<GpgKey>>> {
    require_read_access(&state, &auth)?;
    Ok(Json(state.modules.list_gpg_keys(&ctx, &namespace).await?))
}

async fn add_gpg_key(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(namespace): Path<String>,
    Json(body): Json<AddGpgKeyRequest>,
) -> Result<(StatusCode, Json<GpgKey>)> {
    let key = state
        .modules
        .add_gpg_key(&auth, &ctx, &namespace, body)
        .await?;
    Ok((StatusCode::CREATED, Json(key)))
}

async fn delete_gpg_key(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path((namespace, key_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state
        .modules
        .delete_gpg_key(&auth, &ctx, &namespace, &key_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_gpg_key(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(key_id): Path<String>,
) -> Result<Json<GpgKey>> {
    require_read_access(&state, &auth)?;
    Ok(Json(state.modules.find_gpg_key(&ctx, &key_id).await?))
}
