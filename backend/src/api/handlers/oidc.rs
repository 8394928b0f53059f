//! Terraform CLI identity provider endpoints.

use axum::{
    extract::{Extension, Form, Query, State},
    http::{header, HeaderMap, HeaderValue, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};

use crate::api::SharedState;
use crate::db::TxContext;
use crate::error::{AppError, Result};
use crate::services::auth_context::AuthContext;
use crate::services::auth_service::RequestCredentials;
use crate::services::terraform_idp_service::{
    AuthorizeOutcome, AuthorizeRequest, DiscoveryDocument, JwkSet, TokenRequest, UserInfo,
    AUTHORIZE_PATH, JWKS_PATH, TOKEN_PATH, USERINFO_PATH,
};

const LOGIN_PATH: &str = "/login";

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route(JWKS_PATH, get(jwks))
        .route(AUTHORIZE_PATH, get(authorize))
        .route(TOKEN_PATH, post(token))
        .route(USERINFO_PATH, get(userinfo))
}

async fn openid_configuration(State(state): State<SharedState>) -> Result<Json<DiscoveryDocument>> {
    Ok(Json(state.idp.discovery_document()?))
}

async fn jwks(State(state): State<SharedState>) -> Result<Json<JwkSet>> {
    Ok(Json(state.idp.jwks()?))
}

/// Issue an authorization code, or bounce anonymous browsers to the login
/// page with a way back here.
async fn authorize(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Extension(ctx): Extension<TxContext>,
    uri: Uri,
    Query(request): Query<AuthorizeRequest>,
) -> Result<Redirect> {
    match state.idp.authorize(&auth, &ctx, request).await? {
        AuthorizeOutcome::Redirect(location) => Ok(Redirect::to(&location)),
        AuthorizeOutcome::LoginRequired => Ok(Redirect::to(&login_redirect(&uri))),
    }
}

fn login_redirect(uri: &Uri) -> String {
    let back = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(AUTHORIZE_PATH);
    format!("{}?redirect={}", LOGIN_PATH, urlencoding::encode(back))
}

async fn token(
    State(state): State<SharedState>,
    Extension(ctx): Extension<TxContext>,
    Form(request): Form<TokenRequest>,
) -> Result<Response> {
    let response = state.idp.exchange_code(&ctx, request).await?;
    Ok((
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        Json(response),
    )
        .into_response())
}

async fn userinfo(
    State(state): State<SharedState>,
    Extension(ctx): Extension<TxContext>,
    headers: HeaderMap,
) -> Result<Json<UserInfo>> {
    let bearer = RequestCredentials::from_headers(&headers)
        .bearer
        .ok_or_else(|| AppError::Authentication("Bearer token required".into()))?;
    Ok(Json(state.idp.userinfo(&ctx, &bearer).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_redirect_keeps_query() {
        let uri: Uri = "/terraform/oidc/authorize?client_id=terraform-cli&state=a%20b"
            .parse()
            .unwrap();
        assert_eq!(
            login_redirect(&uri),
            "/login?redirect=%2Fterraform%2Foidc%2Fauthorize%3Fclient_id%3Dterraform-cli%26state%3Da%2520b"
        );
    }
}
