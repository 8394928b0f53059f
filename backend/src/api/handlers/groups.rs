//! User group management handlers.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use serde::Deserialize;

use crate::api::SharedState;
use crate::db::TxContext;
use crate::error::Result;
use crate::models::permission::PermissionLevel;
use crate::models::user_group::UserGroup;
use crate::services::auth_context::AuthContext;

/// Create group routes
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/:name", delete(delete_group))
        .route(
            "/:name/permissions/:namespace",
            put(set_permission).delete(remove_permission),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub site_admin: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionRequest {
    pub permission_type: PermissionLevel,
}

async fn list_groups(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
) -> Result<Json<Vec<UserGroup>>> {
    Ok(Json(state.modules.list_user_groups(&auth, &ctx).await?))
}

async fn create_group(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<UserGroup>)> {
    let group = state
        .modules
        .create_user_group(&auth, &ctx, &payload.name, payload.site_admin)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn delete_group(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.modules.delete_user_group(&auth, &ctx, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_permission(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path((name, namespace)): Path<(String, String)>,
    Json(payload): Json<SetPermissionRequest>,
) -> Result<Json<UserGroup>> {
    let group = state
        .modules
        .set_group_permission(&auth, &ctx, &name, &namespace, payload.permission_type)
        .await?;
    Ok(Json(group))
}

async fn remove_permission(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path((name, namespace)): Path<(String, String)>,
) -> Result<Json<UserGroup>> {
    let group = state
        .modules
        .remove_group_permission(&auth, &ctx, &name, &namespace)
        .await?;
    Ok(Json(group))
}
