//! Authentication token handlers, mounted at `/v1/terrareg/auth/tokens`.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::SharedState;
use crate::db::repository::AuthTokenFilter;
use crate::db::TxContext;
use crate::error::Result;
use crate::models::auth_token::{AuthTokenCreated, AuthenticationToken};
use crate::services::auth_context::AuthContext;
use crate::services::token_service::CreateTokenRequest;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_tokens).post(create_token))
        .route("/:id", delete(revoke_token))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTokensQuery {
    pub namespace: Option<String>,
    pub active: Option<bool>,
}

async fn list_tokens(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Query(query): Query<ListTokensQuery>,
) -> Result<Json<Vec<AuthenticationToken>>> {
    let filter = AuthTokenFilter {
        namespace: query.namespace,
        active: query.active,
    };
    Ok(Json(state.tokens.list_tokens(&auth, &ctx, &filter).await?))
}

/// The plaintext value is only ever returned here.
async fn create_token(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Json(body): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<AuthTokenCreated>)> {
    let created = state.tokens.create_token(&auth, &ctx, body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn revoke_token(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.tokens.revoke_token(&auth, &ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
