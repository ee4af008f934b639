//! API Middleware
//!
//! Bearer authentication for operator endpoints.

pub mod auth;

pub use auth::{require_auth, JwtState, Operator};
