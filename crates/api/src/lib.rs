// API crate clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Ledgerly API Library
//!
//! This crate contains the HTTP surface for Ledgerly: the gateway webhook
//! endpoint, the authenticated billing endpoints, and the balance query.

pub mod alerting;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use alerting::AlertService;
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
