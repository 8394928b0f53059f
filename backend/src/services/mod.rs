//! Business logic services.

pub mod analytics_service;
pub mod archive_service;
pub mod auth_context;
pub mod auth_service;
pub mod command;
pub mod git_service;
pub mod github_service;
pub mod ingestion_service;
pub mod module_parser;
pub mod module_service;
pub mod scheduler_service;
pub mod security_scan_service;
pub mod session_service;
pub mod terraform_idp_service;
pub mod token_service;
