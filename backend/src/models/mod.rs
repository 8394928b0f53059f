//! Domain models.

pub mod analytics;
pub mod auth_token;
pub mod gpg_key;
pub mod identifiers;
pub mod module_details;
pub mod module_provider;
pub mod module_version;
pub mod namespace;
pub mod permission;
pub mod session;
pub mod terraform_idp;
pub mod user_group;
pub mod version;
