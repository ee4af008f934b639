//! JWT (JSON Web Token) handling

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer written into every token minted by the control plane
pub const ISSUER: &str = "wirewarp-control";

/// Dashboard/operator bearer tokens
pub const TOKEN_TYPE_SESSION: &str = "session";

/// Long-lived agent credentials
pub const TOKEN_TYPE_AGENT: &str = "agent";

/// JWT claims shared by session tokens and agent credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (operator name or agent ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Token ID; for agent credentials this is the agent's current credential ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// "session" or "agent"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl JwtClaims {
    pub fn new(subject: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: ISSUER.to_string(),
            aud: audience,
            jti: None,
            token_type: None,
        }
    }

    /// Operator session token claims
    pub fn session(subject: String, validity: Duration) -> Self {
        Self::new(subject, "wirewarp-dashboard".to_string(), validity)
            .with_token_type(TOKEN_TYPE_SESSION.to_string())
    }

    pub fn with_token_type(mut self, token_type: String) -> Self {
        self.token_type = Some(token_type);
        self
    }

    pub fn with_jti(mut self, jti: String) -> Self {
        self.jti = Some(jti);
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn is_session(&self) -> bool {
        self.token_type.as_deref() == Some(TOKEN_TYPE_SESSION)
    }

    pub fn exp_formatted(&self) -> String {
        use chrono::{DateTime, Local};
        let dt = DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now);
        let local: DateTime<Local> = dt.into();
        local.format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates signature and expiration only. Audience is checked by callers
    /// through the `token_type` claim.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.set_issuer(&[ISSUER]);

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data =
            decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                    _ => JwtError::InvalidToken(e.to_string()),
                }
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn test_session_token_roundtrip() {
        let claims = JwtClaims::session("operator".to_string(), Duration::hours(1));
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let decoded = JwtValidator::new(TEST_SECRET).validate(&token).unwrap();

        assert_eq!(decoded.sub, "operator");
        assert_eq!(decoded.iss, ISSUER);
        assert!(decoded.is_session());
    }

    #[test]
    fn test_expired_token() {
        let claims = JwtClaims::session("operator".to_string(), Duration::seconds(-120));
        assert!(claims.is_expired());

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let result = JwtValidator::new(TEST_SECRET).validate(&token);

        assert!(matches!(result, Err(JwtError::TokenExpired)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = JwtClaims::session("operator".to_string(), Duration::hours(1));
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let result = JwtValidator::new(b"another-secret").validate(&token);
        assert!(matches!(result, Err(JwtError::InvalidToken(_))));
    }

    #[test]
    fn test_foreign_issuer_rejected() {
        let mut claims = JwtClaims::session("operator".to_string(), Duration::hours(1));
        claims.iss = "someone-else".to_string();
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        assert!(JwtValidator::new(TEST_SECRET).validate(&token).is_err());
    }
}
