//! Control-plane error taxonomy

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;
use wirewarp_auth::JwtError;
use wirewarp_proto::{AgentType, ForwardProtocol};

/// Coarse error category, used by outer layers to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input
    Validation,
    /// Referenced entity absent
    NotFound,
    /// Port overlap, type mismatch, dependents exist
    Conflict,
    /// Registration token invalid, expired or used
    Token,
    /// Missing or invalid credential
    Auth,
    /// Storage or other collaborator failure
    Service,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("{id} refers to a {actual} record, expected a {expected} record")]
    TypeMismatch {
        id: Uuid,
        expected: AgentType,
        actual: AgentType,
    },

    #[error(
        "{protocol} port {public_port} on tunnel server {tunnel_server_id} is already claimed by rule {rule_id}"
    )]
    PortConflict {
        rule_id: Uuid,
        tunnel_server_id: Uuid,
        protocol: ForwardProtocol,
        public_port: u16,
    },

    #[error("Agent {agent_id} still has a {dependent}; remove it first or delete with cascade")]
    AgentHasDependents {
        agent_id: Uuid,
        dependent: &'static str,
    },

    #[error(
        "Tunnel network {tunnel_network} would exclude client {tunnel_client_id} at {tunnel_ip}"
    )]
    TunnelNetworkShrinkConflict {
        tunnel_network: String,
        tunnel_client_id: Uuid,
        tunnel_ip: String,
    },

    #[error(
        "Tunnel network {tunnel_network} reserves {tunnel_ip} for the server, but client {tunnel_client_id} holds it"
    )]
    ServerAddressConflict {
        tunnel_network: String,
        tunnel_client_id: Uuid,
        tunnel_ip: String,
    },

    #[error("Agent {agent_id} already has a tunnel {kind} record")]
    AlreadyProvisioned { agent_id: Uuid, kind: AgentType },

    #[error("Tunnel client {tunnel_client_id} is referenced by {count} port-forward rule(s)")]
    ClientHasForwards { tunnel_client_id: Uuid, count: u64 },

    #[error("Service template '{0}' already exists")]
    DuplicateTemplate(String),

    #[error("No free address left in tunnel network {tunnel_network}")]
    AddressPoolExhausted { tunnel_network: String },

    #[error("Registration token is invalid")]
    TokenInvalid,

    #[error("Registration token has expired")]
    TokenExpired,

    #[error("Registration token has already been used")]
    TokenAlreadyUsed,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Credential error: {0}")]
    Credential(#[from] JwtError),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Validation(_) => ErrorKind::Validation,
            ControlError::NotFound { .. } | ControlError::AgentNotFound(_) => ErrorKind::NotFound,
            ControlError::TypeMismatch { .. }
            | ControlError::PortConflict { .. }
            | ControlError::AgentHasDependents { .. }
            | ControlError::TunnelNetworkShrinkConflict { .. }
            | ControlError::ServerAddressConflict { .. }
            | ControlError::AlreadyProvisioned { .. }
            | ControlError::ClientHasForwards { .. }
            | ControlError::DuplicateTemplate(_)
            | ControlError::AddressPoolExhausted { .. } => ErrorKind::Conflict,
            ControlError::TokenInvalid
            | ControlError::TokenExpired
            | ControlError::TokenAlreadyUsed => ErrorKind::Token,
            ControlError::Auth(_) => ErrorKind::Auth,
            ControlError::Credential(_) | ControlError::Database(_) => ErrorKind::Service,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Validation(_) => "VALIDATION_ERROR",
            ControlError::NotFound { .. } => "NOT_FOUND",
            ControlError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            ControlError::TypeMismatch { .. } => "TYPE_MISMATCH",
            ControlError::PortConflict { .. } => "PORT_CONFLICT",
            ControlError::AgentHasDependents { .. } => "AGENT_HAS_DEPENDENTS",
            ControlError::TunnelNetworkShrinkConflict { .. } => "TUNNEL_NETWORK_SHRINK_CONFLICT",
            ControlError::ServerAddressConflict { .. } => "SERVER_ADDRESS_CONFLICT",
            ControlError::AlreadyProvisioned { .. } => "ALREADY_PROVISIONED",
            ControlError::ClientHasForwards { .. } => "CLIENT_HAS_FORWARDS",
            ControlError::DuplicateTemplate(_) => "DUPLICATE_TEMPLATE",
            ControlError::AddressPoolExhausted { .. } => "ADDRESS_POOL_EXHAUSTED",
            ControlError::TokenInvalid => "TOKEN_INVALID",
            ControlError::TokenExpired => "TOKEN_EXPIRED",
            ControlError::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            ControlError::Auth(_) => "UNAUTHORIZED",
            ControlError::Credential(_) => "CREDENTIAL_ERROR",
            ControlError::Database(_) => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        ControlError::Validation(msg.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: Uuid) -> Self {
        ControlError::NotFound { entity, id }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ControlError::TokenAlreadyUsed.kind(), ErrorKind::Token);
        assert_eq!(
            ControlError::AgentNotFound(Uuid::nil()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ControlError::Database(DbErr::Custom("down".into())).kind(),
            ErrorKind::Service
        );
        assert_eq!(
            ControlError::AgentHasDependents {
                agent_id: Uuid::nil(),
                dependent: "tunnel server",
            }
            .kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_port_conflict_names_rule() {
        let rule_id = Uuid::new_v4();
        let err = ControlError::PortConflict {
            rule_id,
            tunnel_server_id: Uuid::new_v4(),
            protocol: ForwardProtocol::Tcp,
            public_port: 8080,
        };
        assert_eq!(err.code(), "PORT_CONFLICT");
        assert!(err.to_string().contains(&rule_id.to_string()));
        assert!(err.to_string().contains("tcp port 8080"));
    }
}
