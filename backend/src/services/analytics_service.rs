//! Module download analytics.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::repository::AnalyticsRepository;
use crate::db::{Store, TxContext};
use crate::error::Result;
use crate::models::analytics::{DownloadEvent, DownloadSummary};
use crate::models::module_provider::ModuleProvider;
use crate::models::module_version::ModuleVersion;
use crate::services::auth_context::AuthContext;

/// Analytics service for download recording and reporting.
pub struct AnalyticsService {
    store: Arc<dyn Store>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a download of `version`. Returns whether an event was stored.
    pub async fn record_download(
        &self,
        auth: &AuthContext,
        ctx: &TxContext,
        provider: &ModuleProvider,
        version: &ModuleVersion,
        terraform_version: Option<&str>,
    ) -> Result<bool> {
        if !auth.should_record_analytics() {
            tracing::debug!(module = %provider.ident, "Skipping analytics for internal download");
            return Ok(false);
        }
        if !auth.analytics_allowed_for(&provider.ident) {
            tracing::debug!(module = %provider.ident, "Analytics key not valid for module");
            return Ok(false);
        }

        let event = DownloadEvent {
            id: Uuid::new_v4(),
            module_version_id: version.id,
            timestamp: Utc::now(),
            terraform_version: terraform_version
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from),
            analytics_token: auth.terraform_auth_token().map(String::from),
            auth_method: auth.auth_method().to_string(),
            environment: None,
        };
        self.store.record_download(ctx, &event).await?;
        tracing::debug!(
            module = %provider.ident,
            version = %version.version,
            auth_method = %event.auth_method,
            "Recorded module download"
        );
        Ok(true)
    }

    /// Download counts for every version of a provider, newest first.
    pub async fn download_summary(&self, ctx: &TxContext, provider: &ModuleProvider) -> Result<DownloadSummary> {
        let mut summary = DownloadSummary::default();
        for version in provider.versions().rev() {
            let count = self.store.count_downloads(ctx, &[version.id]).await?;
            summary.total += count;
            summary.per_version.push((version.version.to_string(), count));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::identifiers::ModuleProviderId;
    use crate::models::module_provider::GitConfig;
    use crate::models::version::Version;

    fn provider() -> ModuleProvider {
        let mut provider = ModuleProvider::new(
            ModuleProviderId::new("acme", "vpc", "aws").unwrap(),
            GitConfig::default(),
        );
        for v in ["1.0.0", "1.1.0"] {
            provider
                .add_version(ModuleVersion::new(Version::parse(v).unwrap()))
                .unwrap();
        }
        provider
    }

    #[tokio::test]
    async fn test_records_and_summarises_downloads() {
        let store = Arc::new(MemoryStore::new());
        let svc = AnalyticsService::new(store.clone());
        let ctx = TxContext::background();
        let provider = provider();
        let v1 = provider.get_version(&Version::parse("1.0.0").unwrap()).unwrap();
        let v2 = provider.get_version(&Version::parse("1.1.0").unwrap()).unwrap();

        let analytics = AuthContext::TerraformAnalytics {
            key: "dev-key".into(),
            allowed_modules: None,
        };
        assert!(svc
            .record_download(&analytics, &ctx, &provider, v1, Some("1.5.7"))
            .await
            .unwrap());
        assert!(svc
            .record_download(&AuthContext::NotAuthenticated, &ctx, &provider, v2, None)
            .await
            .unwrap());
        assert!(svc
            .record_download(&AuthContext::NotAuthenticated, &ctx, &provider, v2, Some(" "))
            .await
            .unwrap());

        let summary = svc.download_summary(&ctx, &provider).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(
            summary.per_version,
            vec![("1.1.0".to_string(), 2), ("1.0.0".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_internal_extraction_is_not_recorded() {
        let store = Arc::new(MemoryStore::new());
        let svc = AnalyticsService::new(store.clone());
        let provider = provider();
        let version = provider.versions().next().unwrap();
        let recorded = svc
            .record_download(
                &AuthContext::TerraformInternalExtraction,
                &TxContext::background(),
                &provider,
                version,
                Some("1.5.7"),
            )
            .await
            .unwrap();
        assert!(!recorded);
        assert_eq!(store.download_count(), 0);
    }

    #[tokio::test]
    async fn test_analytics_key_restricted_to_modules() {
        let store = Arc::new(MemoryStore::new());
        let svc = AnalyticsService::new(store.clone());
        let provider = provider();
        let version = provider.versions().next().unwrap();
        let auth = AuthContext::TerraformAnalytics {
            key: "team-key".into(),
            allowed_modules: Some(vec!["acme/other/aws".into()]),
        };
        assert!(!svc
            .record_download(&auth, &TxContext::background(), &provider, version, None)
            .await
            .unwrap());
        assert_eq!(store.download_count(), 0);
    }
}
