//! Module download analytics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadEvent {
    pub id: Uuid,
    pub module_version_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub terraform_version: Option<String>,
    pub analytics_token: Option<String>,
    pub auth_method: String,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadSummary {
    pub total: i64,
    pub per_version: Vec<(String, i64)>,
}
