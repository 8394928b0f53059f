//! Common test utilities for backend integration tests
//!
//! - A full router over the in-memory store and a temporary data directory
//! - A scripted `CommandRunner` standing in for git, terraform-docs and tfsec
//! - Request helpers for `tower::ServiceExt::oneshot`

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use terrareg_backend::api::{routes, AppState, SharedState};
use terrareg_backend::config::Config;
use terrareg_backend::db::MemoryStore;
use terrareg_backend::error::Result;
use terrareg_backend::services::command::{CommandOutput, CommandRunner, CommandSpec};
use terrareg_backend::storage::filesystem::FilesystemStorage;

pub const ADMIN_TOKEN: &str = "admin-secret";
pub const ISSUER: &str = "https://registry.example.com";
pub const CLONE_URL: &str = "https://git.example.com/{namespace}/{module}.git";

pub const README: &str = "# VPC\n\nCreates a VPC with public and private subnets for the acme platform.\n";
pub const MAIN_TF: &str = "variable \"cidr\" {\n  type = string\n}\n";

/// Answers git, terraform-docs and tfsec invocations from a tag table.
#[derive(Default)]
pub struct ScriptedRunner {
    tags: Mutex<HashMap<String, String>>,
    clones: Mutex<HashMap<PathBuf, String>>,
    pub calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    /// Make `tag` cloneable, resolving HEAD to `sha`.
    pub fn add_tag(&self, tag: &str, sha: &str) {
        self.tags
            .lock()
            .unwrap()
            .insert(tag.to_string(), sha.to_string());
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program.clone())
            .collect()
    }

    fn clone_repo(&self, spec: &CommandSpec) -> CommandOutput {
        let branch = spec
            .args
            .iter()
            .position(|a| a == "--branch")
            .and_then(|i| spec.args.get(i + 1))
            .cloned()
            .unwrap_or_default();
        let dest = PathBuf::from(spec.args.last().cloned().unwrap_or_default());
        let Some(sha) = self.tags.lock().unwrap().get(&branch).cloned() else {
            return failed(128, &format!("fatal: Remote branch {} not found in upstream origin", branch));
        };

        std::fs::create_dir_all(dest.join(".git")).unwrap();
        std::fs::write(dest.join(".git/HEAD"), &sha).unwrap();
        std::fs::write(dest.join("main.tf"), MAIN_TF).unwrap();
        std::fs::write(dest.join("README.md"), README).unwrap();
        self.clones.lock().unwrap().insert(dest, sha);
        ok(Vec::new())
    }
}

fn ok(stdout: Vec<u8>) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout,
        stderr: Vec::new(),
    }
}

fn failed(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(status),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

fn terraform_docs_json() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "header": "",
        "footer": "",
        "inputs": [{
            "name": "cidr",
            "type": "string",
            "description": "VPC CIDR block",
            "default": null,
            "required": true
        }],
        "outputs": null,
        "providers": null,
        "requirements": [{"name": "terraform", "version": ">= 1.3"}],
        "resources": null,
        "modules": null
    }))
    .unwrap()
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec, _cancel: &CancellationToken) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let output = match (spec.program.as_str(), spec.args.first().map(String::as_str)) {
            ("git", Some("clone")) => self.clone_repo(&spec),
            ("git", Some("rev-parse")) => {
                let dir = spec.working_dir.clone().unwrap_or_default();
                match self.clones.lock().unwrap().get(&dir) {
                    Some(sha) => ok(format!("{}\n", sha).into_bytes()),
                    None => failed(128, "fatal: not a git repository"),
                }
            }
            ("git", Some("log")) => ok(b"2024-05-01T12:00:00+00:00\n".to_vec()),
            ("terraform-docs", _) => ok(terraform_docs_json()),
            ("tfsec", _) => ok(br#"{"results": []}"#.to_vec()),
            _ => failed(127, "command not found"),
        };
        Ok(output)
    }
}

pub fn fixture_path(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config {
        store_backend: "memory".into(),
        public_url: ISSUER.into(),
        data_directory: data_dir.to_string_lossy().into_owned(),
        secret_key: "test-signing-secret".into(),
        admin_authentication_token: ADMIN_TOKEN.into(),
        git_clone_retries: 1,
        ..Config::default()
    };
    config.terraform_oidc.issuer_url = ISSUER.into();
    config.terraform_oidc.signing_key_path = Some(fixture_path("idp_signing_key.pem"));
    config
}

pub struct TestApp {
    pub router: Router,
    pub state: SharedState,
    pub runner: Arc<ScriptedRunner>,
    pub data_dir: TempDir,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|h| h.to_str().ok())
    }

    /// `name=value` of the first `Set-Cookie` for `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .filter_map(|h| h.split(';').next())
            .find(|pair| pair.starts_with(&format!("{}=", name)))
            .map(String::from)
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = test_config(data_dir.path());
        adjust(&mut config);

        let runner = Arc::new(ScriptedRunner::default());
        let storage = Arc::new(FilesystemStorage::new(data_dir.path().join("archives")));
        let state = Arc::new(
            AppState::new(config, Arc::new(MemoryStore::new()), storage, runner.clone()).unwrap(),
        );
        Self {
            router: routes::create_router(state.clone()),
            state,
            runner,
            data_dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Request authenticated with the admin API key.
    pub async fn admin(&self, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        self.send(json_request(method, uri, body, &[("x-terrareg-apikey", ADMIN_TOKEN)]))
            .await
    }

    pub async fn anonymous(&self, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        self.send(json_request(method, uri, body, &[])).await
    }

    /// Create namespace `acme` and provider `acme/vpc/aws` cloning from
    /// [`CLONE_URL`] with the given tag format.
    pub async fn seed_provider(&self, tag_format: &str) {
        let response = self
            .admin(
                Method::POST,
                "/v1/terrareg/namespaces",
                Some(serde_json::json!({ "name": "acme" })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);

        let response = self
            .admin(
                Method::POST,
                "/v1/terrareg/modules/acme/vpc/aws",
                Some(serde_json::json!({
                    "repo_clone_url_template": CLONE_URL,
                    "git_tag_format": tag_format,
                })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    }

    pub async fn import(&self, body: Value) -> TestResponse {
        self.admin(
            Method::POST,
            "/v1/terrareg/modules/acme/vpc/aws/import",
            Some(body),
        )
        .await
    }
}

pub fn json_request(
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}
