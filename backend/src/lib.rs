//! Terrareg - Backend Library
//!
//! Private Terraform module registry: git and upload ingestion, the
//! Terraform registry protocol, and an OIDC identity provider for
//! `terraform login`.

#[macro_use]
mod macros;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
