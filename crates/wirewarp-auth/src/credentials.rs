//! Agent credentials
//!
//! An agent credential is a JWT whose `jti` is the credential ID currently
//! recorded on the agent row. Rotating that ID invalidates every earlier
//! credential without touching the agent's identity.

use chrono::Duration;
use uuid::Uuid;

use crate::jwt::{JwtClaims, JwtError, JwtValidator, TOKEN_TYPE_AGENT};

/// Identity proven by a valid agent credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentCredential {
    pub agent_id: Uuid,
    pub credential_id: Uuid,
}

/// Mints and verifies agent credentials
pub struct AgentCredentials {
    secret: Vec<u8>,
    validator: JwtValidator,
    validity: Duration,
}

impl AgentCredentials {
    pub fn new(secret: &[u8], validity: Duration) -> Self {
        Self {
            secret: secret.to_vec(),
            validator: JwtValidator::new(secret),
            validity,
        }
    }

    pub fn issue(&self, agent_id: Uuid, credential_id: Uuid) -> Result<String, JwtError> {
        let claims = JwtClaims::new(
            agent_id.to_string(),
            "wirewarp-agent".to_string(),
            self.validity,
        )
        .with_token_type(TOKEN_TYPE_AGENT.to_string())
        .with_jti(credential_id.to_string());

        JwtValidator::encode(&self.secret, &claims)
    }

    /// Check signature, expiry and token type. The caller still has to compare
    /// `credential_id` against the agent's current one.
    pub fn verify(&self, token: &str) -> Result<AgentCredential, JwtError> {
        let claims = self.validator.validate(token)?;

        if claims.token_type.as_deref() != Some(TOKEN_TYPE_AGENT) {
            return Err(JwtError::InvalidToken(
                "Not an agent credential".to_string(),
            ));
        }

        let agent_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| JwtError::InvalidToken("Malformed agent ID".to_string()))?;
        let credential_id = claims
            .jti
            .as_deref()
            .and_then(|jti| Uuid::parse_str(jti).ok())
            .ok_or_else(|| JwtError::InvalidToken("Missing credential ID".to_string()))?;

        Ok(AgentCredential {
            agent_id,
            credential_id,
        })
    }
}
