//! Operator session authentication
//!
//! Operator endpoints take an HS256 session JWT as
//! `Authorization: Bearer <token>`. The live status channel passes the same
//! token as a `token` query parameter and is checked with
//! [`JwtState::authorize`] before the upgrade.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wirewarp_auth::{JwtValidator, TOKEN_TYPE_SESSION};

use crate::error::{api_error, ApiError};

/// Authenticated operator, available to handlers via `Extension`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    /// Token subject
    pub subject: String,
}

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            validator: Arc::new(JwtValidator::new(secret)),
        }
    }

    /// Validate a raw session token
    pub fn authorize(&self, token: &str) -> Result<Operator, ApiError> {
        let claims = self.validator.validate(token).map_err(|e| {
            api_error(
                StatusCode::UNAUTHORIZED,
                format!("Invalid or expired token: {}", e),
                "INVALID_TOKEN",
            )
        })?;

        match claims.token_type.as_deref() {
            Some(TOKEN_TYPE_SESSION) => Ok(Operator { subject: claims.sub }),
            Some(other) => Err(api_error(
                StatusCode::UNAUTHORIZED,
                format!(
                    "Invalid token type '{}'. Expected 'session' token for API access",
                    other
                ),
                "INVALID_TOKEN_TYPE",
            )),
            None => Err(api_error(
                StatusCode::UNAUTHORIZED,
                "Token missing 'token_type' claim",
                "MISSING_TOKEN_TYPE",
            )),
        }
    }
}

/// Reject requests without a valid operator session token
///
/// Injects [`Operator`] into the request extensions on success. Agent
/// credentials are rejected here even though they share the signing secret.
pub async fn require_auth(
    state: axum::extract::State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "Missing Authorization header",
                "MISSING_AUTH",
            )
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        api_error(
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format. Expected 'Bearer <token>'",
            "INVALID_AUTH_FORMAT",
        )
    })?;

    let operator = state.authorize(token.trim())?;
    request.extensions_mut().insert(operator);

    Ok(next.run(request).await)
}
