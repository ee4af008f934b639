//! Control-plane records
//!
//! These are the shapes exchanged over the REST API and pushed on the live
//! channel. Storage rows are converted into these by the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Role of a registered machine, fixed by the registration token it redeemed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Server,
    Client,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Server => "server",
            AgentType::Client => "client",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(AgentType::Server),
            "client" => Ok(AgentType::Client),
            other => Err(format!(
                "Invalid agent type '{}'. Expected 'server' or 'client'",
                other
            )),
        }
    }
}

/// Connectivity state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered but never heartbeated
    Pending,
    /// Heartbeat seen within the liveness threshold
    Connected,
    /// Heartbeat liveness lapsed or the agent channel closed
    Disconnected,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Connected => "connected",
            AgentStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgentStatus::Pending),
            "connected" => Ok(AgentStatus::Connected),
            "disconnected" => Ok(AgentStatus::Disconnected),
            other => Err(format!("Invalid agent status '{}'", other)),
        }
    }
}

/// A registered machine running tunnel software
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Agent {
    /// Stable identifier generated at registration
    pub id: Uuid,
    /// Operator label (may be empty)
    pub name: String,
    /// Server or client, immutable after creation
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Reported by the agent
    pub hostname: Option<String>,
    /// Reported by the agent
    pub public_ip: Option<String>,
    /// Reported by the agent
    pub version: Option<String>,
    pub status: AgentStatus,
    /// Most recent heartbeat
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Facts an agent reports about itself on registration and heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct AgentFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// WireGuard public key, once the agent has generated its key pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wg_public_key: Option<String>,
}

/// One telemetry sample reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct AgentMetricSample {
    pub agent_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    /// Reported fields, passed through untouched
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub data: serde_json::Value,
}

/// Registration token as returned at issuance (the only time the secret is visible)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RegistrationToken {
    /// Single-use secret
    pub token: String,
    pub agent_type: AgentType,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Registration token listing entry (secret withheld)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RegistrationTokenSummary {
    /// First group of the secret, for operator recognition
    pub hint: String,
    pub agent_type: AgentType,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// WireGuard-anchoring endpoint, bound 1:1 to a server agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TunnelServer {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub wg_port: u16,
    pub wg_interface: String,
    /// Null until reported by the agent
    pub public_ip: Option<String>,
    pub public_iface: String,
    /// Null until the agent generates its key pair
    pub wg_public_key: Option<String>,
    /// CIDR of the VPN subnet this server anchors
    pub tunnel_network: String,
    pub created_at: DateTime<Utc>,
}

/// Endpoint connecting into a tunnel server's network, bound 1:1 to a client agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TunnelClient {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Unbound until an operator selects a server
    pub tunnel_server_id: Option<Uuid>,
    /// Address inside the bound server's tunnel network
    pub tunnel_ip: Option<String>,
    pub is_gateway: bool,
    /// Local network forwarded on behalf of (gateway mode only)
    pub vm_network: Option<String>,
    /// LAN address of the gateway (gateway mode only)
    pub lan_ip: Option<String>,
    pub wg_public_key: Option<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

/// A tunnel server joined with the clients bound to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TunnelServerView {
    #[serde(flatten)]
    pub server: TunnelServer,
    pub clients: Vec<TunnelClient>,
}

/// Transport protocol of a port-forward rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    Tcp,
    Udp,
}

impl ForwardProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardProtocol::Tcp => "tcp",
            ForwardProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ForwardProtocol::Tcp),
            "udp" => Ok(ForwardProtocol::Udp),
            _ => Err(format!(
                "Invalid protocol '{}'. Expected 'tcp' or 'udp'",
                s
            )),
        }
    }
}

/// Public port on a tunnel server mapped to a destination behind a bound client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct PortForwardRule {
    pub id: Uuid,
    pub tunnel_server_id: Uuid,
    pub tunnel_client_id: Uuid,
    pub protocol: ForwardProtocol,
    pub public_port: u16,
    pub destination_ip: String,
    pub destination_port: u16,
    pub description: Option<String>,
    /// Inactive rules keep their definition but claim no port
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Unvalidated port-forward input
///
/// Ports and protocol stay loosely typed so out-of-range values reach the
/// rule engine and come back as validation errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct PortForwardDraft {
    pub tunnel_server_id: Uuid,
    pub tunnel_client_id: Uuid,
    pub protocol: String,
    pub public_port: i64,
    pub destination_ip: String,
    pub destination_port: i64,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to active
    #[serde(default)]
    pub active: Option<bool>,
}

/// Partial update of a port-forward rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct PortForwardUpdate {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub public_port: Option<i64>,
    #[serde(default)]
    pub destination_ip: Option<String>,
    #[serde(default)]
    pub destination_port: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Protocol selector of a service template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TemplateProtocol {
    Tcp,
    Udp,
    Both,
}

impl TemplateProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateProtocol::Tcp => "tcp",
            TemplateProtocol::Udp => "udp",
            TemplateProtocol::Both => "both",
        }
    }
}

impl FromStr for TemplateProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TemplateProtocol::Tcp),
            "udp" => Ok(TemplateProtocol::Udp),
            "both" => Ok(TemplateProtocol::Both),
            _ => Err(format!(
                "Invalid template protocol '{}'. Expected 'tcp', 'udp' or 'both'",
                s
            )),
        }
    }
}

/// Named protocol/port preset used to pre-fill port-forward drafts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ServiceTemplate {
    pub id: Uuid,
    pub name: String,
    pub protocol: TemplateProtocol,
    /// Compact port list, e.g. "2302-2305,27016"
    pub ports: String,
    pub is_builtin: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_serializes_type_field() {
        let agent = Agent {
            id: Uuid::new_v4(),
            name: "edge-1".to_string(),
            agent_type: AgentType::Server,
            hostname: None,
            public_ip: None,
            version: None,
            status: AgentStatus::Pending,
            last_seen: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["type"], "server");
        assert_eq!(json["status"], "pending");
        assert!(json["last_seen"].is_null());
    }

    #[test]
    fn test_forward_protocol_parse() {
        assert_eq!("tcp".parse::<ForwardProtocol>(), Ok(ForwardProtocol::Tcp));
        assert_eq!("UDP".parse::<ForwardProtocol>(), Ok(ForwardProtocol::Udp));
        assert!("sctp".parse::<ForwardProtocol>().is_err());
        assert!("both".parse::<ForwardProtocol>().is_err());
    }

    #[test]
    fn test_server_view_flattens_server_fields() {
        let view = TunnelServerView {
            server: TunnelServer {
                id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
                wg_port: 51820,
                wg_interface: "wg0".to_string(),
                public_ip: None,
                public_iface: "eth0".to_string(),
                wg_public_key: None,
                tunnel_network: "10.0.0.0/24".to_string(),
                created_at: Utc::now(),
            },
            clients: vec![],
        };

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["wg_port"], 51820);
        assert!(json["clients"].as_array().unwrap().is_empty());
    }
}
