//! GitHub OAuth login.
//!
//! A successful login starts a GitHub session and makes sure a namespace
//! exists for the user and for each organisation they belong to.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::db::repository::NamespaceRepository;
use crate::db::{Store, TxContext};
use crate::error::{AppError, Result};
use crate::models::namespace::{Namespace, NamespaceType};
use crate::models::session::{Session, SessionPrincipal};
use crate::services::session_service::SessionService;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const OAUTH_SCOPE: &str = "read:org";

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Deserialize)]
struct GithubOrg {
    login: String,
}

struct OauthClient {
    client_id: String,
    client_secret: String,
}

pub struct GithubService {
    store: Arc<dyn Store>,
    sessions: Arc<SessionService>,
    http_client: Client,
    oauth: Option<OauthClient>,
    github_url: String,
    api_url: String,
}

impl GithubService {
    pub fn new(config: &Config, store: Arc<dyn Store>, sessions: Arc<SessionService>) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(concat!("terrareg/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let oauth = match (&config.github_client_id, &config.github_client_secret) {
            (Some(id), Some(secret)) => Some(OauthClient {
                client_id: id.clone(),
                client_secret: secret.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            store,
            sessions,
            http_client,
            oauth,
            github_url: config.github_url.trim_end_matches('/').to_string(),
            api_url: config.github_api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.oauth.is_some()
    }

    fn oauth(&self) -> Result<&OauthClient> {
        self.oauth
            .as_ref()
            .ok_or_else(|| AppError::NotFound("GitHub login is not configured".into()))
    }

    /// URL the browser is sent to for authorisation.
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let oauth = self.oauth()?;
        Ok(format!(
            "{}/login/oauth/authorize?client_id={}&scope={}&state={}",
            self.github_url,
            urlencoding::encode(&oauth.client_id),
            urlencoding::encode(OAUTH_SCOPE),
            urlencoding::encode(state)
        ))
    }

    /// Finish the OAuth flow and start a session.
    pub async fn complete_login(&self, ctx: &TxContext, code: &str) -> Result<Session> {
        let access_token = self.exchange_code(code).await?;
        let user: GithubUser = self.api_get(&access_token, "/user").await?;
        let orgs: Vec<GithubOrg> = self.api_get(&access_token, "/user/orgs").await?;
        let organisations: Vec<String> = orgs.into_iter().map(|o| o.login).collect();

        self.ensure_namespace(ctx, &user.login, NamespaceType::GithubUser).await?;
        for org in &organisations {
            self.ensure_namespace(ctx, org, NamespaceType::GithubOrg).await?;
        }

        let session = self
            .sessions
            .create_session(
                ctx,
                &SessionPrincipal::Github {
                    username: user.login.clone(),
                    organisations,
                },
            )
            .await?;
        tracing::info!(username = %user.login, "GitHub login successful");
        Ok(session)
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let oauth = self.oauth()?;
        let params = [
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("code", code),
        ];
        let response = self
            .http_client
            .post(format!("{}/login/oauth/access_token", self.github_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::Authentication(format!("GitHub token exchange failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::Authentication(format!(
                "GitHub token exchange failed with status {}",
                response.status()
            )));
        }
        let body: AccessTokenResponse = response.json().await.map_err(|e| {
            AppError::Authentication(format!("Failed to parse GitHub token response: {}", e))
        })?;
        match (body.access_token, body.error) {
            (Some(token), None) => Ok(token),
            (_, error) => Err(AppError::Authentication(format!(
                "GitHub rejected the authorisation code: {}",
                body.error_description
                    .or(error)
                    .unwrap_or_else(|| "no access token".into())
            ))),
        }
    }

    async fn api_get<T: serde::de::DeserializeOwned>(&self, access_token: &str, path: &str) -> Result<T> {
        let response = self
            .http_client
            .get(format!("{}{}", self.api_url, path))
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| AppError::Authentication(format!("GitHub API request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::Authentication(format!(
                "GitHub API {} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::Authentication(format!("Failed to parse GitHub response: {}", e)))
    }

    async fn ensure_namespace(&self, ctx: &TxContext, name: &str, namespace_type: NamespaceType) -> Result<()> {
        if self.store.find_namespace(ctx, name).await?.is_some() {
            return Ok(());
        }
        let namespace = match Namespace::new(name, None, namespace_type) {
            Ok(namespace) => namespace,
            Err(e) => {
                tracing::warn!(name, error = %e, "Cannot create namespace for GitHub account");
                return Ok(());
            }
        };
        self.store.save_namespace(ctx, &namespace).await?;
        tracing::info!(namespace = %name, namespace_type = %namespace_type, "Created namespace from GitHub login");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn mock_github() -> String {
        let app = Router::new()
            .route(
                "/login/oauth/access_token",
                post(|body: String| async move {
                    if body.contains("code=good") {
                        Json(json!({ "access_token": "gho_test", "token_type": "bearer" }))
                    } else {
                        Json(json!({ "error": "bad_verification_code" }))
                    }
                }),
            )
            .route("/user", get(|| async { Json(json!({ "login": "octocat", "id": 1 })) }))
            .route(
                "/user/orgs",
                get(|| async { Json(json!([{ "login": "acme" }, { "login": "-bad-" }])) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn service(base_url: &str, store: Arc<MemoryStore>) -> GithubService {
        let config = Config {
            github_client_id: Some("client".into()),
            github_client_secret: Some("secret".into()),
            github_url: base_url.into(),
            github_api_url: base_url.into(),
            ..Config::default()
        };
        let sessions = Arc::new(SessionService::new(&config, store.clone()));
        GithubService::new(&config, store, sessions).unwrap()
    }

    #[test]
    fn test_disabled_without_credentials() {
        let store = Arc::new(MemoryStore::new());
        let config = Config::default();
        let sessions = Arc::new(SessionService::new(&config, store.clone()));
        let svc = GithubService::new(&config, store, sessions).unwrap();
        assert!(!svc.is_enabled());
        assert!(matches!(svc.authorize_url("s"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_authorize_url() {
        let svc = service("https://github.example.com/", Arc::new(MemoryStore::new()));
        assert_eq!(
            svc.authorize_url("st ate").unwrap(),
            "https://github.example.com/login/oauth/authorize?client_id=client&scope=read%3Aorg&state=st%20ate"
        );
    }

    #[tokio::test]
    async fn test_login_creates_session_and_namespaces() {
        let base = mock_github().await;
        let store = Arc::new(MemoryStore::new());
        let svc = service(&base, store.clone());
        let ctx = TxContext::background();

        let session = svc.complete_login(&ctx, "good").await.unwrap();
        assert_eq!(
            session.principal().unwrap(),
            SessionPrincipal::Github {
                username: "octocat".into(),
                organisations: vec!["acme".into(), "-bad-".into()],
            }
        );
        let user_ns = store.find_namespace(&ctx, "octocat").await.unwrap().unwrap();
        assert_eq!(user_ns.namespace_type, NamespaceType::GithubUser);
        let org_ns = store.find_namespace(&ctx, "acme").await.unwrap().unwrap();
        assert_eq!(org_ns.namespace_type, NamespaceType::GithubOrg);
        assert!(store.find_namespace(&ctx, "-bad-").await.unwrap().is_none());

        // A second login leaves existing namespaces alone.
        svc.complete_login(&ctx, "good").await.unwrap();
        assert_eq!(
            store.find_namespace(&ctx, "acme").await.unwrap().unwrap().id,
            org_ns.id
        );
    }

    #[tokio::test]
    async fn test_rejected_code() {
        let base = mock_github().await;
        let svc = service(&base, Arc::new(MemoryStore::new()));
        assert!(matches!(
            svc.complete_login(&TxContext::background(), "bad").await,
            Err(AppError::Authentication(_))
        ));
    }
}
