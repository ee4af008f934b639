//! Authentication primitives for the WireWarp control plane
//!
//! - Operator session tokens and agent credentials are HS256 JWTs
//! - Registration tokens are random single-use secrets stored as SHA-256 hashes

pub mod credentials;
pub mod jwt;
pub mod token;

pub use credentials::{AgentCredential, AgentCredentials};
pub use jwt::{JwtClaims, JwtError, JwtValidator, TOKEN_TYPE_AGENT, TOKEN_TYPE_SESSION};
pub use token::{generate_registration_token, hash_token, token_hint};
