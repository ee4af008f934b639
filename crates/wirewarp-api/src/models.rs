use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use wirewarp_proto::{
    Agent, AgentMetricSample, AgentType, ForwardProtocol, PortForwardRule,
    RegistrationTokenSummary, ServiceTemplate, TunnelClient, TunnelServerView,
};

/// Distinguishes an absent field from an explicit `null`
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Agents holding a live channel
    pub connected_agents: usize,
    /// Open live status observers
    pub observers: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Request to issue a registration token
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueTokenRequest {
    pub agent_type: AgentType,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenList {
    pub tokens: Vec<RegistrationTokenSummary>,
    pub total: usize,
}

/// Redeem a registration token over HTTP
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemTokenRequest {
    /// Registration token secret
    pub token: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Operator label; defaults to the hostname
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemTokenResponse {
    pub agent: Agent,
    /// Agent credential (JWT) for the agent channel
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialResponse {
    pub agent_id: Uuid,
    /// Fresh agent credential; earlier ones no longer validate
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentList {
    pub agents: Vec<Agent>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RenameAgentRequest {
    pub name: String,
}

/// Query for agent deletion
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteAgentQuery {
    #[serde(default)]
    pub cascade: bool,
}

fn default_metrics_limit() -> u64 {
    100
}

/// Query for listing an agent's metric samples
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQuery {
    /// Newest samples to return (1-1000)
    #[serde(default = "default_metrics_limit")]
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetricList {
    pub samples: Vec<AgentMetricSample>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Tunnel topology
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTunnelServerRequest {
    pub agent_id: Uuid,
    /// WireGuard listen port (default 51820)
    #[serde(default)]
    pub wg_port: Option<i64>,
    /// WireGuard interface (default wg0)
    #[serde(default)]
    pub wg_interface: Option<String>,
    /// Public-facing interface (default eth0)
    #[serde(default)]
    pub public_iface: Option<String>,
    /// Tunnel network CIDR (default 10.0.0.0/24)
    #[serde(default)]
    pub tunnel_network: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateTunnelServerRequest {
    #[serde(default)]
    pub wg_port: Option<i64>,
    #[serde(default)]
    pub public_iface: Option<String>,
    #[serde(default)]
    pub tunnel_network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelServerList {
    pub servers: Vec<TunnelServerView>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTunnelClientRequest {
    pub agent_id: Uuid,
}

/// Partial update of a tunnel client
///
/// `tunnel_server_id` binds the client; an explicit `null` unbinds it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateTunnelClientRequest {
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<Uuid>)]
    pub tunnel_server_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub is_gateway: Option<bool>,
    #[serde(default)]
    pub vm_network: Option<String>,
    #[serde(default)]
    pub lan_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelClientList {
    pub clients: Vec<TunnelClient>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Port forwards
// ---------------------------------------------------------------------------

/// Query for listing port-forward rules
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortForwardQuery {
    pub tunnel_server_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PortForwardList {
    pub rules: Vec<PortForwardRule>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Service templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTemplateRequest {
    pub name: String,
    /// tcp, udp or both
    pub protocol: String,
    /// Comma-separated ports and ranges, e.g. "2302-2305,27016"
    pub ports: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TemplateList {
    pub templates: Vec<ServiceTemplate>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplyTemplateRequest {
    pub tunnel_server_id: Uuid,
    pub tunnel_client_id: Uuid,
    pub destination_ip: String,
    /// Only used by templates covering both protocols
    #[serde(default)]
    pub protocol: Option<ForwardProtocol>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_update_distinguishes_null_from_absent() {
        let absent: UpdateTunnelClientRequest =
            serde_json::from_str(r#"{"is_gateway":false}"#).unwrap();
        assert_eq!(absent.tunnel_server_id, None);

        let unbind: UpdateTunnelClientRequest =
            serde_json::from_str(r#"{"tunnel_server_id":null}"#).unwrap();
        assert_eq!(unbind.tunnel_server_id, Some(None));

        let id = Uuid::new_v4();
        let bind: UpdateTunnelClientRequest =
            serde_json::from_str(&format!(r#"{{"tunnel_server_id":"{}"}}"#, id)).unwrap();
        assert_eq!(bind.tunnel_server_id, Some(Some(id)));
    }
}
