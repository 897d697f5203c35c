// API crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError flows through ApiError conversions
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Recap API Library
//!
//! HTTP surface of the billing pipeline: the payment webhook endpoint,
//! health check and webhook audit routes.

pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use security::security_headers_middleware;
pub use state::AppState;
