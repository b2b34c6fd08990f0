// API crate clippy configuration
#![allow(clippy::single_match)] // Clearer in some cases
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! TenantAuth API Library
//!
//! Request-scoped account authentication: credential parsing, sessions,
//! identity resolution and the axum middleware tying them together, plus the
//! account HTTP routes.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResponse, ApiResult};
pub use state::AppState;
