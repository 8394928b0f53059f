//! Authentication handlers, mounted at `/v1/terrareg/auth`.

use axum::{
    extract::{Extension, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::tokens;
use crate::api::SharedState;
use crate::db::TxContext;
use crate::error::{AppError, Result};
use crate::models::session::Session;
use crate::services::auth_context::{AuthContext, AuthStatus};
use crate::services::auth_service::RequestCredentials;
use crate::services::session_service::{generate_session_id, SESSION_COOKIE};

const GITHUB_STATE_COOKIE: &str = "terrareg_github_state";
const GITHUB_STATE_MAX_AGE_SECS: i64 = 600;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/admin/login", post(admin_login))
        .route("/logout", post(logout))
        .route("/status", get(status))
        .route("/github/login", get(github_login))
        .route("/github/callback", get(github_callback))
        .nest("/tokens", tokens::router())
}

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

fn cookie(state: &SharedState, name: &str, value: &str, max_age_secs: i64) -> Result<HeaderValue> {
    let secure = if state.config.public_url.starts_with("https://") {
        "; Secure"
    } else {
        ""
    };
    HeaderValue::from_str(&format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{}",
        name, value, max_age_secs, secure
    ))
    .map_err(|e| AppError::Internal(format!("Invalid cookie value: {}", e)))
}

fn session_cookie(state: &SharedState, session: &Session) -> Result<HeaderValue> {
    cookie(state, SESSION_COOKIE, &session.id, state.sessions.lifetime().num_seconds())
}

fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

// ---------------------------------------------------------------------------
// Admin session
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub authenticated: bool,
    pub csrf_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Start an admin session using the configured admin token as password.
async fn admin_login(
    State(state): State<SharedState>,
    Extension(ctx): Extension<TxContext>,
    Json(payload): Json<AdminLoginRequest>,
) -> Result<Response> {
    let session = state.sessions.login_admin(&ctx, &payload.password).await?;
    let set_cookie = session_cookie(&state, &session)?;
    let body = LoginResponse {
        authenticated: true,
        csrf_token: session.csrf_token.clone(),
        expires_at: session.expires_at,
    };
    Ok(([(header::SET_COOKIE, set_cookie)], Json(body)).into_response())
}

async fn logout(
    State(state): State<SharedState>,
    Extension(ctx): Extension<TxContext>,
    headers: HeaderMap,
) -> Result<Response> {
    if let Some(id) = RequestCredentials::from_headers(&headers).session_id {
        state.sessions.delete_session(&ctx, &id).await?;
    }
    let cleared = cookie(&state, SESSION_COOKIE, "", 0)?;
    Ok(([(header::SET_COOKIE, cleared)], StatusCode::NO_CONTENT).into_response())
}

async fn status(Extension(auth): Extension<AuthContext>) -> Json<AuthStatus> {
    Json(auth.status())
}

// ---------------------------------------------------------------------------
// GitHub OAuth
// ---------------------------------------------------------------------------

async fn github_login(State(state): State<SharedState>) -> Result<Response> {
    if !state.github.is_enabled() {
        return Err(AppError::NotFound("GitHub login is not configured".into()));
    }
    let oauth_state = generate_session_id();
    let url = state.github.authorize_url(&oauth_state)?;
    let set_cookie = cookie(&state, GITHUB_STATE_COOKIE, &oauth_state, GITHUB_STATE_MAX_AGE_SECS)?;
    Ok(([(header::SET_COOKIE, set_cookie)], Redirect::to(&url)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct GithubCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

async fn github_callback(
    State(state): State<SharedState>,
    Extension(ctx): Extension<TxContext>,
    headers: HeaderMap,
    Query(query): Query<GithubCallbackQuery>,
) -> Result<Response> {
    if let Some(error) = query.error {
        return Err(AppError::Authentication(format!("GitHub login failed: {}", error)));
    }
    let expected = read_cookie(&headers, GITHUB_STATE_COOKIE);
    match (expected, query.state.as_deref()) {
        (Some(expected), Some(provided)) if !expected.is_empty() && expected == provided => {}
        _ => return Err(AppError::Authentication("OAuth state mismatch".into())),
    }
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::Validation("Missing code".into()))?;

    let session = state.github.complete_login(&ctx, &code).await?;
    let mut response = Redirect::to("/").into_response();
    let headers = response.headers_mut();
    headers.append(header::SET_COOKIE, session_cookie(&state, &session)?);
    headers.append(header::SET_COOKIE, cookie(&state, GITHUB_STATE_COOKIE, "", 0)?);
    Ok(response)
}
