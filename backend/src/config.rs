//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;
use std::str::FromStr;

/// Archive format produced for module versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            other => Err(AppError::Config(format!("Unknown archive format: {}", other))),
        }
    }
}

/// A configured Terraform analytics token and the modules it may report on.
#[derive(Clone, PartialEq, Eq)]
pub struct AnalyticsAuthKey {
    pub key: String,
    /// `None` means every module.
    pub allowed_modules: Option<Vec<String>>,
}

redacted_debug!(AnalyticsAuthKey {
    redact key,
    show allowed_modules,
});

impl FromStr for AnalyticsAuthKey {
    type Err = AppError;

    /// Parses `key` or `key:ns/module/provider|ns/module/provider`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (key, modules) = match s.split_once(':') {
            Some((key, modules)) => (key, Some(modules)),
            None => (s, None),
        };
        if key.is_empty() {
            return Err(AppError::Config("Empty analytics auth key".into()));
        }
        let allowed_modules = match modules {
            Some(list) => {
                let ids: Vec<String> = list
                    .split('|')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(|m| m.to_lowercase())
                    .collect();
                if ids.iter().any(|m| m.split('/').count() != 3) {
                    return Err(AppError::Config(format!(
                        "Analytics key module list must contain namespace/module/provider ids: {}",
                        list
                    )));
                }
                Some(ids)
            }
            None => None,
        };
        Ok(Self {
            key: key.to_string(),
            allowed_modules,
        })
    }
}

/// Terraform OIDC identity provider settings.
#[derive(Debug, Clone, Default)]
pub struct TerraformOidcConfig {
    /// Empty issuer disables the identity provider.
    pub issuer_url: String,
    pub client_id: String,
    pub redirect_uris: Vec<String>,
    pub token_ttl_secs: i64,
    pub allow_unsafe_redirects: bool,
    /// PKCS#8 PEM file with the RSA signing key; generated at startup when unset.
    pub signing_key_path: Option<String>,
}

impl TerraformOidcConfig {
    pub fn is_enabled(&self) -> bool {
        !self.issuer_url.is_empty()
    }
}

/// Application configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: Option<String>,

    /// "postgres" or "memory"
    pub store_backend: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// External base URL of the registry
    pub public_url: String,

    /// Root for archives and scratch directories
    pub data_directory: String,

    /// HMAC key for signed archive URLs
    pub secret_key: String,

    /// Admin API key / admin login password; empty disables both
    pub admin_authentication_token: String,

    pub admin_session_expiry_mins: i64,

    pub allow_unauthenticated_access: bool,

    pub delete_externally_hosted_artifacts: bool,

    pub examples_directory: String,

    pub example_file_extensions: Vec<String>,

    pub additional_module_files: Vec<String>,

    pub archive_formats: Vec<ArchiveFormat>,

    /// Caps on what an uploaded archive may expand to
    pub upload_max_extracted_bytes: u64,
    pub upload_max_entries: usize,

    pub git_clone_timeout_secs: u64,
    pub git_clone_depth: u32,
    pub git_clone_retries: u32,
    pub git_credentials_username: Option<String>,
    pub git_credentials_password: Option<String>,

    pub git_binary: String,
    pub terraform_docs_binary: String,
    pub tfsec_binary: String,
    pub infracost_binary: String,
    pub infracost_api_key: Option<String>,

    pub analytics_auth_keys: Vec<AnalyticsAuthKey>,
    pub internal_extraction_analytics_token: String,

    pub terraform_oidc: TerraformOidcConfig,

    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,
    pub github_url: String,
    pub github_api_url: String,

    /// OTLP endpoint for span export (optional)
    pub otel_endpoint: Option<String>,
}

redacted_debug!(Config {
    redact_option database_url,
    show store_backend,
    show bind_address,
    show public_url,
    show data_directory,
    redact secret_key,
    redact admin_authentication_token,
    show admin_session_expiry_mins,
    show allow_unauthenticated_access,
    show delete_externally_hosted_artifacts,
    show examples_directory,
    show example_file_extensions,
    show additional_module_files,
    show archive_formats,
    show upload_max_extracted_bytes,
    show upload_max_entries,
    show git_clone_timeout_secs,
    show git_clone_depth,
    show git_clone_retries,
    show git_credentials_username,
    redact_option git_credentials_password,
    show git_binary,
    show terraform_docs_binary,
    show tfsec_binary,
    show infracost_binary,
    redact_option infracost_api_key,
    show analytics_auth_keys,
    redact internal_extraction_analytics_token,
    show terraform_oidc,
    show github_client_id,
    redact_option github_client_secret,
    show github_url,
    show github_api_url,
    show otel_endpoint,
});

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            store_backend: "postgres".into(),
            bind_address: "0.0.0.0:5000".into(),
            public_url: "http://localhost:5000".into(),
            data_directory: "./data".into(),
            secret_key: String::new(),
            admin_authentication_token: String::new(),
            admin_session_expiry_mins: 60,
            allow_unauthenticated_access: true,
            delete_externally_hosted_artifacts: false,
            examples_directory: "examples".into(),
            example_file_extensions: vec!["tf".into(), "tfvars".into(), "sh".into(), "json".into()],
            additional_module_files: vec!["CHANGELOG.md".into(), "LICENSE".into()],
            archive_formats: vec![ArchiveFormat::Zip, ArchiveFormat::TarGz],
            upload_max_extracted_bytes: 1024 * 1024 * 1024,
            upload_max_entries: 10_000,
            git_clone_timeout_secs: 300,
            git_clone_depth: 1,
            git_clone_retries: 3,
            git_credentials_username: None,
            git_credentials_password: None,
            git_binary: "git".into(),
            terraform_docs_binary: "terraform-docs".into(),
            tfsec_binary: "tfsec".into(),
            infracost_binary: "infracost".into(),
            infracost_api_key: None,
            analytics_auth_keys: Vec::new(),
            internal_extraction_analytics_token: String::new(),
            terraform_oidc: TerraformOidcConfig {
                client_id: "terraform-cli".into(),
                redirect_uris: vec!["http://localhost:10000/login".into()],
                token_ttl_secs: 3600,
                ..Default::default()
            },
            github_client_id: None,
            github_client_secret: None,
            github_url: "https://github.com".into(),
            github_api_url: "https://api.github.com".into(),
            otel_endpoint: None,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env_opt(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env_opt(name) {
        Some(raw) => parse_bool(&raw)
            .ok_or_else(|| AppError::Config(format!("{} must be a boolean: {}", name, raw))),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_list(name: &str, default: Vec<String>) -> Vec<String> {
    match env_opt(name) {
        Some(raw) => split_list(&raw),
        None => default,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let store_backend = env_or("STORE_BACKEND", &defaults.store_backend);
        let database_url = env_opt("DATABASE_URL");
        if store_backend == "postgres" && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL not set".into()));
        }

        let admin_authentication_token = env_or("ADMIN_AUTHENTICATION_TOKEN", "");
        let secret_key = env_or("SECRET_KEY", "");
        if !admin_authentication_token.is_empty() && secret_key.is_empty() {
            return Err(AppError::Config(
                "SECRET_KEY must be set when ADMIN_AUTHENTICATION_TOKEN is configured".into(),
            ));
        }

        let archive_formats = match env_opt("ARCHIVE_FORMATS") {
            Some(raw) => split_list(&raw)
                .iter()
                .map(|f| f.parse())
                .collect::<Result<Vec<ArchiveFormat>>>()?,
            None => defaults.archive_formats.clone(),
        };

        let analytics_auth_keys = match env_opt("ANALYTICS_AUTH_KEYS") {
            Some(raw) => split_list(&raw)
                .iter()
                .map(|k| k.parse())
                .collect::<Result<Vec<AnalyticsAuthKey>>>()?,
            None => Vec::new(),
        };

        let terraform_oidc = TerraformOidcConfig {
            issuer_url: env_or("TERRAFORM_OIDC_ISSUER_URL", "")
                .trim_end_matches('/')
                .to_string(),
            client_id: env_or("TERRAFORM_OIDC_CLIENT_ID", "terraform-cli"),
            redirect_uris: env_list(
                "TERRAFORM_OIDC_REDIRECT_URIS",
                vec!["http://localhost:10000/login".into()],
            ),
            token_ttl_secs: env_parse("TERRAFORM_OIDC_TOKEN_TTL", 3600)?,
            allow_unsafe_redirects: env_bool("TERRAFORM_OIDC_ALLOW_UNSAFE_REDIRECTS", false)?,
            signing_key_path: env_opt("TERRAFORM_OIDC_SIGNING_KEY_PATH"),
        };
        if terraform_oidc.token_ttl_secs <= 0 {
            return Err(AppError::Config(
                "TERRAFORM_OIDC_TOKEN_TTL must be positive".into(),
            ));
        }

        Ok(Self {
            database_url,
            store_backend,
            bind_address: env_or("BIND_ADDRESS", &defaults.bind_address),
            public_url: env_or("PUBLIC_URL", &defaults.public_url)
                .trim_end_matches('/')
                .to_string(),
            data_directory: env_or("DATA_DIRECTORY", &defaults.data_directory),
            secret_key,
            admin_authentication_token,
            admin_session_expiry_mins: env_parse("ADMIN_SESSION_EXPIRY_MINS", 60)?,
            allow_unauthenticated_access: env_bool("ALLOW_UNAUTHENTICATED_ACCESS", true)?,
            delete_externally_hosted_artifacts: env_bool(
                "DELETE_EXTERNALLY_HOSTED_ARTIFACTS",
                false,
            )?,
            examples_directory: env_or("EXAMPLES_DIRECTORY", &defaults.examples_directory),
            example_file_extensions: env_list(
                "EXAMPLE_FILE_EXTENSIONS",
                defaults.example_file_extensions.clone(),
            ),
            additional_module_files: env_list(
                "ADDITIONAL_MODULE_FILES",
                defaults.additional_module_files.clone(),
            ),
            archive_formats,
            upload_max_extracted_bytes: env_parse(
                "UPLOAD_MAX_EXTRACTED_BYTES",
                defaults.upload_max_extracted_bytes,
            )?,
            upload_max_entries: env_parse("UPLOAD_MAX_ENTRIES", defaults.upload_max_entries)?,
            git_clone_timeout_secs: env_parse("GIT_CLONE_TIMEOUT", 300)?,
            git_clone_depth: env_parse("GIT_CLONE_DEPTH", 1)?,
            git_clone_retries: env_parse("GIT_CLONE_RETRIES", 3)?,
            git_credentials_username: env_opt("GIT_CREDENTIALS_USERNAME"),
            git_credentials_password: env_opt("GIT_CREDENTIALS_PASSWORD"),
            git_binary: env_or("GIT_BINARY", &defaults.git_binary),
            terraform_docs_binary: env_or("TERRAFORM_DOCS_BINARY", &defaults.terraform_docs_binary),
            tfsec_binary: env_or("TFSEC_BINARY", &defaults.tfsec_binary),
            infracost_binary: env_or("INFRACOST_BINARY", &defaults.infracost_binary),
            infracost_api_key: env_opt("INFRACOST_API_KEY"),
            analytics_auth_keys,
            internal_extraction_analytics_token: env_or("INTERNAL_EXTRACTION_ANALYTICS_TOKEN", ""),
            terraform_oidc,
            github_client_id: env_opt("GITHUB_CLIENT_ID"),
            github_client_secret: env_opt("GITHUB_CLIENT_SECRET"),
            github_url: env_or("GITHUB_URL", &defaults.github_url)
                .trim_end_matches('/')
                .to_string(),
            github_api_url: env_or("GITHUB_API_URL", &defaults.github_api_url)
                .trim_end_matches('/')
                .to_string(),
            otel_endpoint: env_opt("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    /// Host part of the public URL, as used in Terraform `source` strings.
    pub fn public_host(&self) -> &str {
        let without_scheme = self
            .public_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.public_url);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }

    pub fn github_login_enabled(&self) -> bool {
        self.github_client_id.is_some() && self.github_client_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analytics_key_without_modules() {
        let key: AnalyticsAuthKey = "abc123".parse().unwrap();
        assert_eq!(key.key, "abc123");
        assert!(key.allowed_modules.is_none());
    }

    #[test]
    fn test_analytics_key_with_modules() {
        let key: AnalyticsAuthKey = "abc:acme/vpc/aws|Acme/DNS/aws".parse().unwrap();
        assert_eq!(
            key.allowed_modules,
            Some(vec!["acme/vpc/aws".to_string(), "acme/dns/aws".to_string()])
        );
    }

    #[test]
    fn test_analytics_key_rejects_bad_module_id() {
        assert!("abc:acme/vpc".parse::<AnalyticsAuthKey>().is_err());
        assert!(":acme/vpc/aws".parse::<AnalyticsAuthKey>().is_err());
    }

    #[test]
    fn test_archive_format_parse() {
        assert_eq!("zip".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
        assert_eq!("tar.gz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_public_host() {
        let config = Config {
            public_url: "https://registry.example.com/base".into(),
            ..Config::default()
        };
        assert_eq!(config.public_host(), "registry.example.com");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config {
            admin_authentication_token: "super-admin-token".into(),
            secret_key: "hmac-secret".into(),
            ..Config::default()
        };
        let output = format!("{:?}", config);
        assert!(!output.contains("super-admin-token"));
        assert!(!output.contains("hmac-secret"));
    }
}
