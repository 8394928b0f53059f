//! Resolved principal and its capability set.
//!
//! Every credential kind reduces to one [`AuthContext`] variant. Capability
//! queries are answered by exhaustive matches so each row of the capability
//! table lives in one place and adding a variant forces a decision on every
//! query.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::error::{AppError, Result};
use crate::models::identifiers::{names_match, ModuleProviderId};
use crate::models::permission::{NamespacePermissions, PermissionLevel, WILDCARD_NAMESPACE};

/// Scope a Terraform OIDC token needs to use the read API.
pub const TERRAFORM_READ_SCOPE: &str = "read";

/// Permissions held by an SSO or local user session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserPrincipal {
    pub username: String,
    pub groups: Vec<String>,
    /// Effective permissions, already merged over all groups.
    pub permissions: NamespacePermissions,
    pub site_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthContext {
    #[default]
    NotAuthenticated,
    AdminSession {
        csrf_token: String,
    },
    /// `built_in` is true for the configured admin token, false for a
    /// persisted admin-type API key.
    AdminApiKey {
        built_in: bool,
    },
    UserSession {
        user: UserPrincipal,
        csrf_token: String,
    },
    PublishApiKey {
        namespace: String,
    },
    UploadApiKey,
    Saml {
        user: UserPrincipal,
        attributes: BTreeMap<String, Vec<String>>,
        csrf_token: String,
    },
    Oidc {
        user: UserPrincipal,
        claims: serde_json::Value,
        csrf_token: String,
    },
    Github {
        username: String,
        organisations: Vec<String>,
        csrf_token: String,
    },
    TerraformOidc {
        subject: String,
        scopes: Vec<String>,
    },
    TerraformAnalytics {
        key: String,
        /// `None` allows every module.
        allowed_modules: Option<Vec<String>>,
    },
    TerraformInternalExtraction,
}

/// Snapshot of capabilities, returned by the auth status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub auth_method: &'static str,
    pub username: Option<String>,
    pub site_admin: bool,
    pub read_access: bool,
    pub terraform_access: bool,
    pub user_groups: Vec<String>,
    pub namespace_permissions: NamespacePermissions,
    pub csrf_token: Option<String>,
}

impl AuthContext {
    /// Name of the authentication method, recorded with analytics.
    pub fn auth_method(&self) -> &'static str {
        match self {
            AuthContext::NotAuthenticated => "not_authenticated",
            AuthContext::AdminSession { .. } => "admin_session",
            AuthContext::AdminApiKey { .. } => "admin_api_key",
            AuthContext::UserSession { .. } => "user_session",
            AuthContext::PublishApiKey { .. } => "publish_api_key",
            AuthContext::UploadApiKey => "upload_api_key",
            AuthContext::Saml { .. } => "saml",
            AuthContext::Oidc { .. } => "openid_connect",
            AuthContext::Github { .. } => "github",
            AuthContext::TerraformOidc { .. } => "terraform_oidc",
            AuthContext::TerraformAnalytics { .. } => "terraform_analytics_auth_key",
            AuthContext::TerraformInternalExtraction => "terraform_internal_extraction",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, AuthContext::NotAuthenticated)
    }

    pub fn is_admin(&self) -> bool {
        match self {
            AuthContext::AdminSession { .. }
            | AuthContext::AdminApiKey { .. }
            | AuthContext::TerraformInternalExtraction => true,
            AuthContext::UserSession { user, .. }
            | AuthContext::Saml { user, .. }
            | AuthContext::Oidc { user, .. } => user.site_admin,
            AuthContext::NotAuthenticated
            | AuthContext::PublishApiKey { .. }
            | AuthContext::UploadApiKey
            | AuthContext::Github { .. }
            | AuthContext::TerraformOidc { .. }
            | AuthContext::TerraformAnalytics { .. } => false,
        }
    }

    pub fn is_built_in_admin(&self) -> bool {
        match self {
            AuthContext::AdminApiKey { built_in } => *built_in,
            AuthContext::TerraformInternalExtraction => true,
            _ => false,
        }
    }

    pub fn requires_csrf(&self) -> bool {
        match self {
            AuthContext::AdminSession { .. }
            | AuthContext::UserSession { .. }
            | AuthContext::Saml { .. }
            | AuthContext::Oidc { .. }
            | AuthContext::Github { .. } => true,
            AuthContext::NotAuthenticated
            | AuthContext::AdminApiKey { .. }
            | AuthContext::PublishApiKey { .. }
            | AuthContext::UploadApiKey
            | AuthContext::TerraformOidc { .. }
            | AuthContext::TerraformAnalytics { .. }
            | AuthContext::TerraformInternalExtraction => false,
        }
    }

    pub fn can_access_read_api(&self) -> bool {
        match self {
            AuthContext::AdminSession { .. }
            | AuthContext::AdminApiKey { .. }
            | AuthContext::UserSession { .. }
            | AuthContext::Saml { .. }
            | AuthContext::Oidc { .. }
            | AuthContext::Github { .. }
            | AuthContext::TerraformAnalytics { .. }
            | AuthContext::TerraformInternalExtraction => true,
            AuthContext::TerraformOidc { scopes, .. } => {
                scopes.iter().any(|s| s == TERRAFORM_READ_SCOPE)
            }
            AuthContext::NotAuthenticated
            | AuthContext::PublishApiKey { .. }
            | AuthContext::UploadApiKey => false,
        }
    }

    pub fn can_access_terraform_api(&self) -> bool {
        match self {
            AuthContext::AdminSession { .. }
            | AuthContext::AdminApiKey { .. }
            | AuthContext::UserSession { .. }
            | AuthContext::Saml { .. }
            | AuthContext::Oidc { .. }
            | AuthContext::Github { .. }
            | AuthContext::TerraformOidc { .. }
            | AuthContext::TerraformInternalExtraction => true,
            AuthContext::NotAuthenticated
            | AuthContext::PublishApiKey { .. }
            | AuthContext::UploadApiKey
            | AuthContext::TerraformAnalytics { .. } => false,
        }
    }

    pub fn can_publish_module_version(&self, namespace: &str) -> bool {
        match self {
            AuthContext::PublishApiKey { namespace: bound } => names_match(bound, namespace),
            AuthContext::UploadApiKey => false,
            _ => self.check_namespace_access(PermissionLevel::Publish, namespace),
        }
    }

    pub fn can_upload_module_version(&self, namespace: &str) -> bool {
        match self {
            AuthContext::PublishApiKey { namespace: bound } => names_match(bound, namespace),
            AuthContext::UploadApiKey => true,
            _ => self.check_namespace_access(PermissionLevel::Upload, namespace),
        }
    }

    /// `is_admin ∨ resolved_level(namespace) ≥ level`.
    pub fn check_namespace_access(&self, level: PermissionLevel, namespace: &str) -> bool {
        self.is_admin() || self.all_namespace_permissions().has(namespace, level)
    }

    pub fn all_namespace_permissions(&self) -> NamespacePermissions {
        match self {
            AuthContext::AdminSession { .. }
            | AuthContext::AdminApiKey { .. }
            | AuthContext::TerraformInternalExtraction => {
                NamespacePermissions::new().with(WILDCARD_NAMESPACE, PermissionLevel::Full)
            }
            AuthContext::UserSession { user, .. }
            | AuthContext::Saml { user, .. }
            | AuthContext::Oidc { user, .. } => {
                let mut perms = user.permissions.clone();
                if user.site_admin {
                    perms.grant(WILDCARD_NAMESPACE, PermissionLevel::Full);
                }
                perms
            }
            AuthContext::Github {
                username,
                organisations,
                ..
            } => {
                let mut perms = NamespacePermissions::new();
                for org in organisations {
                    perms.grant(org, PermissionLevel::Full);
                }
                perms.grant(username, PermissionLevel::Full);
                perms
            }
            AuthContext::PublishApiKey { namespace } => {
                NamespacePermissions::new().with(namespace, PermissionLevel::Publish)
            }
            AuthContext::UploadApiKey => {
                NamespacePermissions::new().with(WILDCARD_NAMESPACE, PermissionLevel::Upload)
            }
            AuthContext::NotAuthenticated
            | AuthContext::TerraformOidc { .. }
            | AuthContext::TerraformAnalytics { .. } => NamespacePermissions::new(),
        }
    }

    pub fn user_group_names(&self) -> Vec<String> {
        match self {
            AuthContext::UserSession { user, .. }
            | AuthContext::Saml { user, .. }
            | AuthContext::Oidc { user, .. } => user.groups.clone(),
            _ => Vec::new(),
        }
    }

    /// Token a Terraform client authenticated with, recorded with analytics.
    pub fn terraform_auth_token(&self) -> Option<&str> {
        match self {
            AuthContext::TerraformAnalytics { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Opaque provider data carried by SSO sessions.
    pub fn provider_data(&self) -> serde_json::Value {
        match self {
            AuthContext::UserSession { user, .. } => json!({ "username": user.username }),
            AuthContext::Saml {
                user, attributes, ..
            } => json!({ "username": user.username, "attributes": attributes }),
            AuthContext::Oidc { user, claims, .. } => {
                json!({ "username": user.username, "claims": claims })
            }
            AuthContext::Github {
                username,
                organisations,
                ..
            } => json!({ "username": username, "organisations": organisations }),
            _ => json!({}),
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            AuthContext::AdminSession { .. } | AuthContext::AdminApiKey { .. } => Some("admin"),
            AuthContext::UserSession { user, .. }
            | AuthContext::Saml { user, .. }
            | AuthContext::Oidc { user, .. } => Some(&user.username),
            AuthContext::Github { username, .. } => Some(username),
            AuthContext::TerraformOidc { subject, .. } => Some(subject),
            _ => None,
        }
    }

    pub fn should_record_analytics(&self) -> bool {
        !matches!(self, AuthContext::TerraformInternalExtraction)
    }

    /// Whether an analytics key may report on a module.
    pub fn analytics_allowed_for(&self, module: &ModuleProviderId) -> bool {
        match self {
            AuthContext::TerraformAnalytics {
                allowed_modules: Some(allowed),
                ..
            } => allowed.iter().any(|m| *m == module.key()),
            _ => true,
        }
    }

    pub fn csrf_token(&self) -> Option<&str> {
        match self {
            AuthContext::AdminSession { csrf_token }
            | AuthContext::UserSession { csrf_token, .. }
            | AuthContext::Saml { csrf_token, .. }
            | AuthContext::Oidc { csrf_token, .. }
            | AuthContext::Github { csrf_token, .. } => Some(csrf_token),
            _ => None,
        }
    }

    /// Enforce the CSRF token of a mutating request.
    pub fn check_csrf(&self, provided: Option<&str>) -> Result<()> {
        if !self.requires_csrf() {
            return Ok(());
        }
        match (self.csrf_token(), provided) {
            (Some(expected), Some(provided))
                if constant_time_eq(expected.as_bytes(), provided.as_bytes()) =>
            {
                Ok(())
            }
            _ => Err(AppError::Authentication("Invalid or missing CSRF token".into())),
        }
    }

    /// Fails with `unauthorized` for anonymous callers and `forbidden` otherwise.
    pub fn deny(&self, what: &str) -> AppError {
        if self.is_authenticated() {
            AppError::Authorization(format!("Not permitted to {}", what))
        } else {
            AppError::Authentication(format!("Authentication required to {}", what))
        }
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(self.deny("perform administrative actions"))
        }
    }

    pub fn status(&self) -> AuthStatus {
        AuthStatus {
            authenticated: self.is_authenticated(),
            auth_method: self.auth_method(),
            username: self.username().map(String::from),
            site_admin: self.is_admin(),
            read_access: self.can_access_read_api(),
            terraform_access: self.can_access_terraform_api(),
            user_groups: self.user_group_names(),
            namespace_permissions: self.all_namespace_permissions(),
            csrf_token: self.csrf_token().map(String::from),
        }
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(site_admin: bool, perms: NamespacePermissions) -> UserPrincipal {
        UserPrincipal {
            username: "bob".into(),
            groups: vec!["devs".into()],
            permissions: perms,
            site_admin,
        }
    }

    fn github() -> AuthContext {
        AuthContext::Github {
            username: "alice".into(),
            organisations: vec!["foo".into(), "bar".into()],
            csrf_token: "csrf".into(),
        }
    }

    fn all_variants() -> Vec<AuthContext> {
        vec![
            AuthContext::NotAuthenticated,
            AuthContext::AdminSession {
                csrf_token: "c".into(),
            },
            AuthContext::AdminApiKey { built_in: true },
            AuthContext::UserSession {
                user: user(false, NamespacePermissions::new()),
                csrf_token: "c".into(),
            },
            AuthContext::PublishApiKey {
                namespace: "acme".into(),
            },
            AuthContext::UploadApiKey,
            github(),
            AuthContext::TerraformOidc {
                subject: "s".into(),
                scopes: vec!["openid".into()],
            },
            AuthContext::TerraformAnalytics {
                key: "k".into(),
                allowed_modules: None,
            },
            AuthContext::TerraformInternalExtraction,
        ]
    }

    /// admin, builtin, csrf, read, tf, publish("acme"), upload("acme")
    fn row(ctx: &AuthContext) -> [bool; 7] {
        [
            ctx.is_admin(),
            ctx.is_built_in_admin(),
            ctx.requires_csrf(),
            ctx.can_access_read_api(),
            ctx.can_access_terraform_api(),
            ctx.can_publish_module_version("acme"),
            ctx.can_upload_module_version("acme"),
        ]
    }

    #[test]
    fn test_capability_table() {
        let expected: Vec<[bool; 7]> = vec![
            [false, false, false, false, false, false, false],
            [true, false, true, true, true, true, true],
            [true, true, false, true, true, true, true],
            [false, false, true, true, true, false, false],
            [false, false, false, false, false, true, true],
            [false, false, false, false, false, false, true],
            [false, false, true, true, true, false, false],
            [false, false, false, false, true, false, false],
            [false, false, false, true, false, false, false],
            [true, true, false, true, true, true, true],
        ];
        for (ctx, expected) in all_variants().iter().zip(expected) {
            assert_eq!(row(ctx), expected, "capabilities of {}", ctx.auth_method());
        }
    }

    #[test]
    fn test_github_namespace_permissions() {
        let perms = github().all_namespace_permissions();
        let expected = NamespacePermissions::new()
            .with("foo", PermissionLevel::Full)
            .with("bar", PermissionLevel::Full)
            .with("alice", PermissionLevel::Full);
        assert_eq!(perms, expected);
        assert_eq!(
            serde_json::to_value(&perms).unwrap(),
            json!({"foo": "FULL", "bar": "FULL", "alice": "FULL"})
        );
    }

    #[test]
    fn test_github_case_insensitive_access() {
        assert!(github().check_namespace_access(PermissionLevel::Full, "Foo"));
        assert!(github().can_publish_module_version("ALICE"));
        assert!(!github().can_publish_module_version("other"));
    }

    #[test]
    fn test_user_session_permission_thresholds() {
        let ctx = AuthContext::UserSession {
            user: user(
                false,
                NamespacePermissions::new()
                    .with("acme", PermissionLevel::Full)
                    .with("readonly", PermissionLevel::Read),
            ),
            csrf_token: "c".into(),
        };
        assert!(ctx.can_publish_module_version("acme"));
        assert!(!ctx.can_upload_module_version("readonly"));
        assert!(ctx.check_namespace_access(PermissionLevel::Read, "readonly"));
        assert!(!ctx.check_namespace_access(PermissionLevel::Modify, "readonly"));
        assert_eq!(ctx.user_group_names(), vec!["devs".to_string()]);
    }

    #[test]
    fn test_site_admin_user_is_admin() {
        let ctx = AuthContext::Saml {
            user: user(true, NamespacePermissions::new()),
            attributes: BTreeMap::new(),
            csrf_token: "c".into(),
        };
        assert!(ctx.is_admin());
        assert!(!ctx.is_built_in_admin());
        assert_eq!(
            ctx.all_namespace_permissions().get("*"),
            Some(PermissionLevel::Full)
        );
    }

    #[test]
    fn test_check_namespace_access_formula() {
        for ctx in all_variants() {
            for level in [
                PermissionLevel::Read,
                PermissionLevel::Modify,
                PermissionLevel::Upload,
                PermissionLevel::Publish,
                PermissionLevel::Full,
            ] {
                let expected = ctx.is_admin()
                    || ctx
                        .all_namespace_permissions()
                        .resolve("acme")
                        .map(|l| l >= level)
                        .unwrap_or(false);
                assert_eq!(ctx.check_namespace_access(level, "acme"), expected);
            }
        }
    }

    #[test]
    fn test_terraform_oidc_read_scope() {
        let ctx = AuthContext::TerraformOidc {
            subject: "s".into(),
            scopes: vec!["openid".into(), "read".into()],
        };
        assert!(ctx.can_access_read_api());
    }

    #[test]
    fn test_internal_extraction_skips_analytics() {
        assert!(!AuthContext::TerraformInternalExtraction.should_record_analytics());
        assert!(AuthContext::NotAuthenticated.should_record_analytics());
    }

    #[test]
    fn test_analytics_key_module_restriction() {
        let ctx = AuthContext::TerraformAnalytics {
            key: "k".into(),
            allowed_modules: Some(vec!["acme/vpc/aws".into()]),
        };
        let allowed = ModuleProviderId::new("Acme", "vpc", "aws").unwrap();
        let denied = ModuleProviderId::new("acme", "dns", "aws").unwrap();
        assert!(ctx.analytics_allowed_for(&allowed));
        assert!(!ctx.analytics_allowed_for(&denied));
        assert_eq!(ctx.terraform_auth_token(), Some("k"));
    }

    #[test]
    fn test_csrf_enforcement() {
        let session = AuthContext::AdminSession {
            csrf_token: "expected".into(),
        };
        assert!(session.check_csrf(Some("expected")).is_ok());
        assert!(session.check_csrf(Some("wrong")).is_err());
        assert!(session.check_csrf(None).is_err());
        assert!(AuthContext::AdminApiKey { built_in: true }
            .check_csrf(None)
            .is_ok());
    }

    #[test]
    fn test_deny_kind_depends_on_authentication() {
        assert!(matches!(
            AuthContext::NotAuthenticated.deny("x"),
            AppError::Authentication(_)
        ));
        assert!(matches!(
            AuthContext::UploadApiKey.deny("x"),
            AppError::Authorization(_)
        ));
    }
}
