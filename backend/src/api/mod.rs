//! API module - HTTP handlers and middleware.

pub mod handlers;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Store;
use crate::error::Result;
use crate::services::analytics_service::AnalyticsService;
use crate::services::archive_service::ArchiveService;
use crate::services::auth_service::AuthService;
use crate::services::command::CommandRunner;
use crate::services::github_service::GithubService;
use crate::services::ingestion_service::IngestionService;
use crate::services::module_service::ModuleService;
use crate::services::session_service::SessionService;
use crate::services::terraform_idp_service::TerraformIdpService;
use crate::services::token_service::TokenService;
use crate::storage::StorageBackend;

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub auth: Arc<AuthService>,
    pub sessions: Arc<SessionService>,
    pub tokens: Arc<TokenService>,
    pub idp: Arc<TerraformIdpService>,
    pub github: Arc<GithubService>,
    pub modules: Arc<ModuleService>,
    pub ingestion: Arc<IngestionService>,
    pub analytics: Arc<AnalyticsService>,
    /// Cancelled on shutdown; every request context derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        storage: Arc<dyn StorageBackend>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let archives = Arc::new(ArchiveService::new(&config, storage));
        let sessions = Arc::new(SessionService::new(&config, store.clone()));
        let tokens = Arc::new(TokenService::new(store.clone()));
        let idp = Arc::new(TerraformIdpService::new(&config, store.clone())?);
        let github = Arc::new(GithubService::new(&config, store.clone(), sessions.clone())?);
        let auth = Arc::new(AuthService::new(
            &config,
            store.clone(),
            tokens.clone(),
            sessions.clone(),
            idp.clone(),
        ));
        let modules = Arc::new(ModuleService::new(&config, store.clone(), archives.clone()));
        let ingestion = Arc::new(IngestionService::new(
            &config,
            store.clone(),
            runner,
            archives,
        ));
        let analytics = Arc::new(AnalyticsService::new(store.clone()));

        Ok(Self {
            config,
            store,
            auth,
            sessions,
            tokens,
            idp,
            github,
            modules,
            ingestion,
            analytics,
            shutdown: CancellationToken::new(),
        })
    }
}

pub type SharedState = Arc<AppState>;
