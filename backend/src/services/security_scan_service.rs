//! tfsec security scans and infracost estimates.
//!
//! Both are advisory: failures are logged and reported as `None` so the
//! ingestion pipeline can continue.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::command::{CommandRunner, CommandSpec};

const SCAN_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SecurityScanService {
    runner: Arc<dyn CommandRunner>,
    tfsec_binary: String,
    infracost_binary: String,
    infracost_api_key: Option<String>,
    /// `TF_TOKEN_<host>` variable letting Terraform reach this registry as
    /// the internal extraction principal.
    registry_token: Option<(String, String)>,
}

/// Environment variable name Terraform reads a registry token from.
pub fn terraform_token_env_name(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    format!("TF_TOKEN_{}", host.replace('-', "__").replace('.', "_"))
}

impl SecurityScanService {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            tfsec_binary: config.tfsec_binary.clone(),
            infracost_binary: config.infracost_binary.clone(),
            infracost_api_key: config.infracost_api_key.clone().filter(|k| !k.is_empty()),
            registry_token: (!config.internal_extraction_analytics_token.is_empty()).then(|| {
                (
                    terraform_token_env_name(config.public_host()),
                    config.internal_extraction_analytics_token.clone(),
                )
            }),
        }
    }

    pub fn cost_estimation_enabled(&self) -> bool {
        self.infracost_api_key.is_some()
    }

    /// Run tfsec over the module tree. Cancellation is the only error.
    pub async fn scan(&self, module_dir: &Path, cancel: &CancellationToken) -> Result<Option<serde_json::Value>> {
        let spec = CommandSpec::new(&self.tfsec_binary)
            .args(["--format", "json", "--soft-fail", "--no-colour", "--ignore-hcl-errors", "."])
            .current_dir(module_dir)
            .timeout(SCAN_TIMEOUT);
        self.run_json("tfsec", spec, cancel).await
    }

    /// Estimate the monthly cost of an example. Returns `None` when cost
    /// estimation is disabled or infracost fails.
    pub async fn estimate_cost(
        &self,
        example_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<serde_json::Value>> {
        let Some(api_key) = &self.infracost_api_key else {
            return Ok(None);
        };
        let mut spec = CommandSpec::new(&self.infracost_binary)
            .args(["breakdown", "--path", ".", "--format", "json", "--no-color"])
            .current_dir(example_dir)
            .env("INFRACOST_API_KEY", api_key.as_str())
            .env("INFRACOST_SKIP_UPDATE_CHECK", "true")
            .timeout(SCAN_TIMEOUT);
        if let Some((name, token)) = &self.registry_token {
            spec = spec.env(name.as_str(), token.as_str());
        }
        self.run_json("infracost", spec, cancel).await
    }

    async fn run_json(
        &self,
        tool: &str,
        spec: CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<serde_json::Value>> {
        let dir = spec.working_dir.clone().unwrap_or_default();
        let output = match self.runner.run(spec, cancel).await {
            Ok(output) => output,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(e) => {
                tracing::warn!(tool, dir = %dir.display(), error = %e, "Scanner could not run");
                return Ok(None);
            }
        };
        if !output.success() {
            tracing::warn!(
                tool,
                dir = %dir.display(),
                status = ?output.status,
                stderr = %output.stderr_str().trim(),
                "Scanner exited with failure"
            );
            return Ok(None);
        }
        match serde_json::from_slice(&output.stdout) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(tool, error = %e, "Scanner produced invalid JSON");
                Ok(None)
            }
        }
    }
}

/// Number of findings in a tfsec report.
pub fn tfsec_finding_count(report: &serde_json::Value) -> usize {
    report
        .get("results")
        .and_then(|r| r.as_array())
        .map(Vec::len)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::command::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedRunner {
        output: Result<CommandOutput>,
        seen: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for FixedRunner {
        async fn run(&self, spec: CommandSpec, _cancel: &CancellationToken) -> Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec);
            match &self.output {
                Ok(output) => Ok(output.clone()),
                Err(AppError::Cancelled) => Err(AppError::Cancelled),
                Err(_) => Err(AppError::Internal("no such binary".into())),
            }
        }
    }

    fn service(output: Result<CommandOutput>, api_key: Option<&str>) -> (SecurityScanService, Arc<FixedRunner>) {
        let runner = Arc::new(FixedRunner {
            output,
            seen: Mutex::new(Vec::new()),
        });
        let config = Config {
            infracost_api_key: api_key.map(str::to_string),
            internal_extraction_analytics_token: "internal-token".into(),
            public_url: "https://registry.example-corp.com".into(),
            ..Config::default()
        };
        (SecurityScanService::new(&config, runner.clone()), runner)
    }

    fn ok(stdout: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            status: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_scan_returns_report() {
        let (svc, _) = service(ok(r#"{"results":[{"rule_id":"AVD-AWS-0086"}]}"#), None);
        let report = svc
            .scan(Path::new("/tmp"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tfsec_finding_count(&report), 1);
    }

    #[tokio::test]
    async fn test_scan_failure_is_not_fatal() {
        let (svc, _) = service(Err(AppError::Internal(String::new())), None);
        let report = svc.scan(Path::new("/tmp"), &CancellationToken::new()).await.unwrap();
        assert!(report.is_none());

        let (svc, _) = service(ok("not json"), None);
        assert!(svc
            .scan(Path::new("/tmp"), &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let (svc, _) = service(Err(AppError::Cancelled), None);
        let result = svc.scan(Path::new("/tmp"), &CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cost_estimation_requires_api_key() {
        let (svc, runner) = service(ok(r#"{"totalMonthlyCost":"12.5"}"#), None);
        assert!(!svc.cost_estimation_enabled());
        assert!(svc
            .estimate_cost(Path::new("/tmp"), &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
        assert!(runner.seen.lock().unwrap().is_empty());

        let (svc, runner) = service(ok(r#"{"totalMonthlyCost":"12.5"}"#), Some("ico-key"));
        let cost = svc
            .estimate_cost(Path::new("/tmp"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cost["totalMonthlyCost"], "12.5");
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].env.get("INFRACOST_API_KEY").map(String::as_str), Some("ico-key"));
        assert_eq!(
            seen[0]
                .env
                .get("TF_TOKEN_registry_example__corp_com")
                .map(String::as_str),
            Some("internal-token")
        );
    }

    #[test]
    fn test_terraform_token_env_name() {
        assert_eq!(terraform_token_env_name("localhost:5000"), "TF_TOKEN_localhost");
        assert_eq!(
            terraform_token_env_name("tf.my-corp.io"),
            "TF_TOKEN_tf_my__corp_io"
        );
    }
}
