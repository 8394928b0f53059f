//! Ingestion and Terraform registry protocol tests over the full router.

mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{TestApp, README};

const SHA_1_2_3: &str = "3f2a9c1d5e7b8a6f4c2d1e0f9a8b7c6d5e4f3a2b";

/// Path and query of an `X-Terraform-Get` location.
fn local_path(location: &str) -> &str {
    location
        .strip_prefix(common::ISSUER)
        .unwrap_or(location)
}

#[tokio::test]
async fn test_publish_by_tag() {
    let app = TestApp::new();
    app.seed_provider("v{version}").await;
    app.runner.add_tag("v1.2.3", SHA_1_2_3);

    let response = app
        .import(json!({ "git_tag": "v1.2.3", "publish": true }))
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(response.body["version"], "1.2.3");
    assert_eq!(response.body["git_sha"], SHA_1_2_3);
    assert_eq!(response.body["git_tag"], "v1.2.3");
    assert_eq!(response.body["published"], true);
    assert_eq!(response.body["latest_version"], "1.2.3");
    assert_eq!(response.body["archive"]["formats"], json!(["zip", "tar.gz"]));

    let details = app
        .anonymous(Method::GET, "/v1/terrareg/modules/acme/vpc/aws/1.2.3", None)
        .await;
    assert_eq!(details.status, StatusCode::OK);
    assert_eq!(details.body["published"], true);
    assert!(details.body["published_at"].is_string());
    assert_eq!(details.body["is_latest"], true);

    let module = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws", None)
        .await;
    assert_eq!(module.status, StatusCode::OK);
    assert_eq!(module.body["id"], "acme/vpc/aws/1.2.3");
    assert_eq!(module.body["root"]["readme"], README);
    assert_eq!(module.body["root"]["inputs"][0]["name"], "cidr");
    assert_eq!(module.body["versions"], json!(["1.2.3"]));

    let versions = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws/versions", None)
        .await;
    assert_eq!(
        versions.body,
        json!({ "modules": [{ "versions": [{ "version": "1.2.3" }] }] })
    );
}

#[tokio::test]
async fn test_download_through_signed_url() {
    let app = TestApp::new();
    app.seed_provider("v{version}").await;
    app.runner.add_tag("v1.2.3", SHA_1_2_3);
    app.import(json!({ "git_tag": "v1.2.3", "publish": true }))
        .await;

    let download = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws/1.2.3/download", None)
        .await;
    assert_eq!(download.status, StatusCode::NO_CONTENT);
    let location = download.header("x-terraform-get").unwrap().to_string();
    assert!(
        location.starts_with("/v1/terrareg/modules/acme/vpc/aws/1.2.3/source.zip?expires="),
        "{}",
        location
    );

    let archive = app
        .anonymous(Method::GET, local_path(&location), None)
        .await;
    assert_eq!(archive.status, StatusCode::OK);
    assert_eq!(archive.header("content-type"), Some("application/zip"));

    let tampered = location.replace("signature=", "signature=00");
    let rejected = app
        .anonymous(Method::GET, local_path(&tampered), None)
        .await;
    assert_eq!(rejected.status, StatusCode::FORBIDDEN);

    let analytics = app
        .anonymous(Method::GET, "/v1/terrareg/modules/acme/vpc/aws/analytics", None)
        .await;
    assert_eq!(analytics.status, StatusCode::OK);
    assert_eq!(analytics.body["total_downloads"], 1);
}

#[tokio::test]
async fn test_duplicate_publish_rejected() {
    let app = TestApp::new();
    app.seed_provider("v{version}").await;
    app.runner.add_tag("v1.2.3", SHA_1_2_3);
    let first = app
        .import(json!({ "git_tag": "v1.2.3", "publish": true }))
        .await;
    assert_eq!(first.status, StatusCode::CREATED);

    let second = app
        .import(json!({ "version": "1.2.3", "publish": true }))
        .await;
    assert_eq!(second.status, StatusCode::CONFLICT, "{}", second.body);
    assert_eq!(second.body["kind"], "already-exists");

    let provider = app
        .anonymous(Method::GET, "/v1/terrareg/modules/acme/vpc/aws", None)
        .await;
    assert_eq!(provider.body["versions"].as_array().unwrap().len(), 1);
    assert_eq!(provider.body["latest_version"], "1.2.3");
    assert_eq!(provider.body["versions"][0]["git_sha"], SHA_1_2_3);
}

#[tokio::test]
async fn test_beta_does_not_become_latest() {
    let app = TestApp::new();
    app.seed_provider("v{version}").await;
    app.runner.add_tag("v1.2.3", "a".repeat(40).as_str());
    app.runner.add_tag("v1.3.0-beta", "b".repeat(40).as_str());
    app.runner.add_tag("v1.3.0", "c".repeat(40).as_str());

    app.import(json!({ "git_tag": "v1.2.3", "publish": true }))
        .await;
    let beta = app
        .import(json!({ "git_tag": "v1.3.0-beta", "publish": true }))
        .await;
    assert_eq!(beta.status, StatusCode::CREATED, "{}", beta.body);
    assert_eq!(beta.body["published"], true);
    assert_eq!(beta.body["latest_version"], "1.2.3");

    let module = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws", None)
        .await;
    assert_eq!(module.body["version"], "1.2.3");

    let release = app
        .import(json!({ "git_tag": "v1.3.0", "publish": true }))
        .await;
    assert_eq!(release.body["latest_version"], "1.3.0");

    let module = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws", None)
        .await;
    assert_eq!(module.body["version"], "1.3.0");
}

#[tokio::test]
async fn test_externally_hosted_skips_archives() {
    let app = TestApp::with_config(|config| config.delete_externally_hosted_artifacts = true);
    app.seed_provider("v{version}").await;
    app.runner.add_tag("v1.0.0", SHA_1_2_3);

    let response = app
        .import(json!({ "version": "1.0.0", "publish": true }))
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert!(response.body["archive"]["skipped_reason"].is_string());
    assert_eq!(response.body["archive"]["formats"], json!([]));
    assert_eq!(response.body["archive"]["total_bytes"], 0);
    assert!(!app.data_dir.path().join("archives").exists());

    let download = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws/1.0.0/download", None)
        .await;
    assert_eq!(download.status, StatusCode::NO_CONTENT);
    assert_eq!(
        download.header("x-terraform-get"),
        Some("git::https://git.example.com/acme/vpc.git?ref=v1.0.0")
    );
}

#[tokio::test]
async fn test_unknown_tag_fails_clone_and_leaves_no_version() {
    let app = TestApp::new();
    app.seed_provider("v{version}").await;

    let response = app
        .import(json!({ "git_tag": "v9.9.9", "publish": true }))
        .await;
    assert_eq!(response.status.as_u16() / 100, 5, "{}", response.body);
    assert_eq!(response.body["kind"], "git-clone-failed");

    let provider = app
        .anonymous(Method::GET, "/v1/terrareg/modules/acme/vpc/aws", None)
        .await;
    assert_eq!(provider.body["versions"], json!([]));
    assert!(!app.runner.programs().contains(&"terraform-docs".to_string()));
}

#[tokio::test]
async fn test_unpublished_version_hidden_from_registry() {
    let app = TestApp::new();
    app.seed_provider("{version}").await;
    app.runner.add_tag("2.0.0", SHA_1_2_3);

    let response = app.import(json!({ "version": "2.0.0" })).await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(response.body["published"], false);

    let hidden = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws/2.0.0", None)
        .await;
    assert_eq!(hidden.status, StatusCode::NOT_FOUND);

    let published = app
        .admin(
            Method::POST,
            "/v1/terrareg/modules/acme/vpc/aws/2.0.0/publish",
            None,
        )
        .await;
    assert_eq!(published.status, StatusCode::OK, "{}", published.body);
    assert_eq!(published.body["latest_version"], "2.0.0");

    let visible = app
        .anonymous(Method::GET, "/v1/modules/acme/vpc/aws/2.0.0", None)
        .await;
    assert_eq!(visible.status, StatusCode::OK);
}

#[tokio::test]
async fn test_service_discovery() {
    let app = TestApp::new();
    let response = app
        .anonymous(Method::GET, "/.well-known/terraform.json", None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["modules.v1"], "/v1/modules/");
    assert_eq!(response.body["login.v1"]["client"], "terraform-cli");
    assert_eq!(response.body["login.v1"]["token"], "/terraform/oidc/token");
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let response = app.anonymous(Method::GET, "/health", None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["checks"]["database"]["status"], "healthy");
    assert!(response.header("x-correlation-id").is_some());
}
