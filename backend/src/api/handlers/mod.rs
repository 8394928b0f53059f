//! HTTP request handlers.

pub mod auth;
pub mod groups;
pub mod health;
pub mod modules;
pub mod namespaces;
pub mod oidc;
pub mod terraform;
pub mod tokens;

use crate::api::AppState;
use crate::error::Result;
use crate::services::auth_context::AuthContext;

/// Terraform protocol endpoints are open unless unauthenticated access is
/// disabled.
pub(crate) fn require_terraform_access(state: &AppState, auth: &AuthContext) -> Result<()> {
    if state.config.allow_unauthenticated_access || auth.can_access_terraform_api() {
        Ok(())
    } else {
        Err(auth.deny("access the Terraform registry"))
    }
}

pub(crate) fn require_read_access(state: &AppState, auth: &AuthContext) -> Result<()> {
    if state.config.allow_unauthenticated_access || auth.can_access_read_api() {
        Ok(())
    } else {
        Err(auth.deny("read registry data"))
    }
}
